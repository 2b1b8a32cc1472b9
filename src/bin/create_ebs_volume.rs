use std::{
    io::{self, Write},
    process,
};

use clap::Parser;
use ebs_provisioner::ec2::{self, VolumeOptions};

/// RUST_LOG=debug create-ebs-volume --size 100 --type gp2
#[derive(Debug, Parser)]
#[command(
    name = "create-ebs-volume",
    about = "Create a new EBS volume and attach it to the current instance"
)]
struct Cli {
    /// Requested volume size in GiB.
    #[arg(short, long, value_parser = clap::value_parser!(i32).range(1..))]
    size: i32,

    /// EBS volume type.
    #[arg(short = 't', long = "type", default_value = "gp2")]
    volume_type: String,

    /// Encrypt the volume. Any non-empty value counts as true; pass an
    /// empty string to disable (historical flag behavior, kept as-is).
    #[arg(short, long, default_value = "true", value_parser = parse_encrypted, action = clap::ArgAction::Set)]
    encrypted: bool,
}

fn parse_encrypted(s: &str) -> Result<bool, String> {
    Ok(!s.is_empty())
}

#[tokio::main]
async fn main() {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();
    let opts = VolumeOptions {
        size: cli.size,
        volume_type: cli.volume_type,
        encrypted: cli.encrypted,
        ..VolumeOptions::default()
    };

    match ec2::create_and_attach_volume(&opts).await {
        Ok(device) => {
            // device path only, no trailing newline
            print!("{}", device);
            let _ = io::stdout().flush();
        }
        Err(e) => {
            log::error!("failed to create and attach volume: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_encrypted_gp2() {
        let cli = Cli::try_parse_from(["create-ebs-volume", "--size", "10"]).unwrap();
        assert_eq!(cli.size, 10);
        assert_eq!(cli.volume_type, "gp2");
        assert!(cli.encrypted);
    }

    #[test]
    fn size_is_required_and_positive() {
        assert!(Cli::try_parse_from(["create-ebs-volume"]).is_err());
        assert!(Cli::try_parse_from(["create-ebs-volume", "--size", "0"]).is_err());
        assert!(Cli::try_parse_from(["create-ebs-volume", "-s", "-3"]).is_err());
    }

    #[test]
    fn any_non_empty_encrypted_value_counts_as_true() {
        let cli = Cli::try_parse_from(["create-ebs-volume", "-s", "10", "-e", "false"]).unwrap();
        assert!(cli.encrypted);

        let cli = Cli::try_parse_from(["create-ebs-volume", "-s", "10", "-e", ""]).unwrap();
        assert!(!cli.encrypted);
    }

    #[test]
    fn short_and_long_type_flags() {
        let cli =
            Cli::try_parse_from(["create-ebs-volume", "-s", "200", "-t", "gp3"]).unwrap();
        assert_eq!(cli.volume_type, "gp3");

        let cli =
            Cli::try_parse_from(["create-ebs-volume", "--size", "200", "--type", "io1"]).unwrap();
        assert_eq!(cli.volume_type, "io1");
    }
}
