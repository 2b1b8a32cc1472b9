pub mod ec2;
pub mod errors;

use aws_config::{self, meta::region::RegionProviderChain};
use aws_types::{region::Region, SdkConfig as AwsSdkConfig};

/// Loads an AWS config from default environments.
/// The explicit "reg" takes precedence over the ambient region chain.
pub async fn load_config(reg: Option<String>) -> AwsSdkConfig {
    log::info!("loading AWS configuration for region {:?}", reg);
    let regp = RegionProviderChain::first_try(reg.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    aws_config::from_env().region(regp).load().await
}
