use anyhow::Result;
use serde_json::{Value, json};
use sliderule::{Client, ClientConfig, Protocol};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sliderule=info")),
        )
        .with_target(false)
        .compact()
        .init();

    // Local server without an organization, plain HTTP.
    let client = Client::init(ClientConfig::new("localhost", None).with_protocol(Protocol::Http))?
        .with_verbose(true)
        .with_progress(true);

    let parms = json!({
        "cnf": "atl03_high",
        "ats": 20.0,
        "cnt": 10,
        "len": 40.0,
        "res": 20.0,
        "maxi": 1
    });
    let resources = ["ATL03_20181019065445_03150111_005_01.h5"];

    let done = client.atl06p_async(&parms, &resources).then(
        |result| {
            let first = result.first().map(|r| r.to_json()).unwrap_or(Value::Null);
            println!("Results = {} {}", result.len(), first);
        },
        |error| eprintln!("Error = {:#}", error),
    );
    done.wait()
}
