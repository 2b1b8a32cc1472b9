use std::{
    fs, io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    time::Instant,
};

use crate::errors::{
    Error::{self, Other},
    Result,
};
use tokio::time::{sleep, Duration};

/// Device letters assigned in order. Slots are never reused or compacted,
/// so a freed letter stays burned for the lifetime of the instance.
pub const DEVICE_ALPHABET: [char; 26] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z',
];

const DEVICE_DIR: &str = "/dev";
const DEVICE_PREFIX: &str = "sd";

/// Computes the device path for the given number of existing devices,
/// e.g., 0 maps to "/dev/sda" and 3 maps to "/dev/sdd".
pub fn device_path_for_count(existing: usize) -> Result<String> {
    match DEVICE_ALPHABET.get(existing) {
        Some(letter) => Ok(format!("{}/{}{}", DEVICE_DIR, DEVICE_PREFIX, letter)),
        None => Err(Error::DeviceSlotsExhausted { existing }),
    }
}

/// Lists the device nodes under "dir" whose name carries the "sd" prefix.
pub fn detect_devices(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut devices: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(DEVICE_PREFIX)
        {
            devices.push(entry.path());
        }
    }
    Ok(devices)
}

/// Picks the next free logical device path on the local machine.
///
/// Not atomic with attachment, so two concurrent invocations on the same
/// instance can race for the same slot.
pub fn next_logical_device() -> Result<String> {
    let devices = detect_devices(Path::new(DEVICE_DIR)).map_err(|e| Other {
        message: format!("failed to list devices under {} {:?}", DEVICE_DIR, e),
        is_retryable: false,
    })?;
    log::info!("found {} existing '{}*' devices", devices.len(), DEVICE_PREFIX);
    device_path_for_count(devices.len())
}

/// Returns whether "path" exists and is a block special file.
/// A missing path maps to Ok(false); any other stat failure is returned
/// to the caller instead of being swallowed.
pub fn block_device_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.file_type().is_block_device()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Polls the local filesystem until "path" shows up as a block device.
pub async fn poll_block_device(path: &Path, timeout: Duration, interval: Duration) -> Result<()> {
    log::info!(
        "polling block device '{}' with timeout {:?} and interval {:?}",
        path.display(),
        timeout,
        interval,
    );

    let start = Instant::now();
    loop {
        let found = block_device_exists(path).map_err(|e| Other {
            message: format!("failed to stat '{}' {:?}", path.display(), e),
            is_retryable: false,
        })?;
        if found {
            log::info!("block device '{}' is visible", path.display());
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed.gt(&timeout) {
            return Err(Other {
                message: format!("block device '{}' did not appear in time", path.display()),
                is_retryable: true,
            });
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_advances_one_letter_per_existing_device() {
        assert_eq!(device_path_for_count(0).unwrap(), "/dev/sda");
        assert_eq!(device_path_for_count(3).unwrap(), "/dev/sdd");
        assert_eq!(device_path_for_count(25).unwrap(), "/dev/sdz");
    }

    #[test]
    fn device_path_fails_once_all_slots_are_taken() {
        match device_path_for_count(26) {
            Err(Error::DeviceSlotsExhausted { existing }) => assert_eq!(existing, 26),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn device_paths_match_single_letter_pattern() {
        for n in 0..26 {
            let path = device_path_for_count(n).unwrap();
            let suffix = path.strip_prefix("/dev/sd").unwrap();
            assert_eq!(suffix.len(), 1);
            assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn detect_devices_counts_only_sd_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["sda", "sdb", "nvme0n1", "xvdq"] {
            fs::File::create(dir.path().join(name)).unwrap();
        }

        let devices = detect_devices(dir.path()).unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn missing_or_regular_paths_are_not_block_devices() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!block_device_exists(&dir.path().join("sdz")).unwrap());

        let regular = dir.path().join("sda");
        fs::File::create(&regular).unwrap();
        assert!(!block_device_exists(&regular).unwrap());
    }

    #[tokio::test]
    async fn poll_block_device_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let res = poll_block_device(
            &dir.path().join("sdq"),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        match res {
            Err(e) => assert!(e.is_retryable()),
            Ok(()) => panic!("expected timeout"),
        }
    }
}
