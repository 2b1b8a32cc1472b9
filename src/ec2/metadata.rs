use crate::errors::{Error::API, Result};
use reqwest::{Client, ClientBuilder};
use tokio::time::Duration;

/// Fetches the instance ID on the host EC2 machine.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-categories.html
pub async fn fetch_instance_id() -> Result<String> {
    fetch_metadata_by_path("instance-id").await
}

/// Fetches the availability zone of the host EC2 machine.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-categories.html
pub async fn fetch_availability_zone() -> Result<String> {
    fetch_metadata_by_path("placement/availability-zone").await
}

/// Fetches the region of the host EC2 machine.
pub async fn fetch_region() -> Result<String> {
    let az = fetch_availability_zone().await?;
    Ok(region_from_az(&az))
}

/// Derives the region by stripping the trailing zone letter
/// (e.g., "us-west-2a" to "us-west-2").
pub fn region_from_az(az: &str) -> String {
    let mut region = az.to_string();
    region.truncate(region.len().saturating_sub(1));
    region
}

/// Fetches instance metadata service v2 with the "path".
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-retrieval.html
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/configuring-instance-metadata-service.html
/// e.g., curl -H "X-aws-ec2-metadata-token: $TOKEN" -v http://169.254.169.254/latest/meta-data/public-ipv4
pub async fn fetch_metadata_by_path(path: &str) -> Result<String> {
    log::info!("fetching meta-data/{}", path);

    let cli = imds_http_client()?;
    let token = fetch_token(&cli).await?;

    let uri = format!("http://169.254.169.254/latest/meta-data/{}", path);
    let resp = cli
        .get(&uri)
        .header("X-aws-ec2-metadata-token", token)
        .send()
        .await
        .map_err(|e| API {
            message: format!("failed GET meta-data/{} {:?}", path, e),
            is_retryable: false,
        })?;
    let out = resp.bytes().await.map_err(|e| API {
        message: format!("failed to read bytes {:?}", e),
        is_retryable: false,
    })?;

    match String::from_utf8(out.to_vec()) {
        Ok(text) => Ok(text),
        Err(e) => Err(API {
            message: format!("GET meta-data/{} failed String::from_utf8 ({})", path, e),
            is_retryable: false,
        }),
    }
}

/// Serves session token for instance metadata service v2.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/configuring-instance-metadata-service.html
/// e.g., curl -X PUT "http://169.254.169.254/latest/api/token" -H "X-aws-ec2-metadata-token-ttl-seconds: 21600"
const IMDS_V2_SESSION_TOKEN_URI: &str = "http://169.254.169.254/latest/api/token";

fn imds_http_client() -> Result<Client> {
    ClientBuilder::new()
        .user_agent(env!("CARGO_PKG_NAME"))
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| API {
            message: format!("failed ClientBuilder build {:?}", e),
            is_retryable: false,
        })
}

/// Fetches the IMDS v2 token.
async fn fetch_token(cli: &Client) -> Result<String> {
    log::info!("fetching IMDS v2 token");

    let resp = cli
        .put(IMDS_V2_SESSION_TOKEN_URI)
        .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
        .send()
        .await
        .map_err(|e| API {
            message: format!("failed PUT api/token {:?}", e),
            is_retryable: false,
        })?;
    let out = resp.bytes().await.map_err(|e| API {
        message: format!("failed to read bytes {:?}", e),
        is_retryable: false,
    })?;

    match String::from_utf8(out.to_vec()) {
        Ok(text) => Ok(text),
        Err(e) => Err(API {
            message: format!("PUT api/token failed String::from_utf8 ({})", e),
            is_retryable: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_strips_trailing_zone_letter() {
        assert_eq!(region_from_az("us-west-2a"), "us-west-2");
        assert_eq!(region_from_az("ap-northeast-1c"), "ap-northeast-1");
        assert_eq!(region_from_az(""), "");
    }
}
