use anyhow::Result;
use sliderule::{Client, ClientConfig, Protocol};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sliderule=info")),
        )
        .compact()
        .init();

    let client = Client::init(ClientConfig::new("localhost", None).with_protocol(Protocol::Http))?;

    match client.h5(
        "ancillary_data/atlas_sdp_gps_epoch",
        "ATL03_20181019065445_03150111_005_01.h5",
        "icesat2",
    ) {
        Ok(values) => println!("GPS Epoch: {:?}", values),
        Err(e) => eprintln!("{:#}", e),
    }
    Ok(())
}
