//! A Rust client for the SlideRule science data processing service.
//!
//! The client configures a service endpoint, sends processing requests with
//! JSON parameters and a list of input resources, and decodes the native
//! binary record stream that comes back.
//!
//! ## Quick start
//! - Point a [`ClientConfig`] at a server (or use [`Client::from_env`], which reads
//!   `SLIDERULE_DOMAIN`, `SLIDERULE_ORGANIZATION` and a `.sliderulerc` file).
//! - Call [`Client::atl06p`] (blocking) or [`Client::atl06p_async`] (background worker).
//!   With no resources and a `poly` parameter, granules are looked up in NASA CMR.
//!
//! ```no_run
//! use anyhow::Result;
//! use serde_json::json;
//! use sliderule::{Client, ClientConfig, Protocol};
//!
//! fn main() -> Result<()> {
//!     let client = Client::init(ClientConfig::new("localhost", None).with_protocol(Protocol::Http))?;
//!     let parms = json!({
//!         "cnf": "atl03_high",
//!         "ats": 20.0,
//!         "cnt": 10,
//!         "len": 40.0,
//!         "res": 20.0,
//!         "maxi": 1
//!     });
//!     client
//!         .atl06p_async(&parms, &["ATL03_20181019065445_03150111_005_01.h5"])
//!         .then(
//!             |result| println!("Results = {} {:?}", result.len(), result.first()),
//!             |error| eprintln!("Error = {:#}", error),
//!         )
//!         .wait()
//! }
//! ```

#![forbid(unsafe_code)]

mod client;
mod config;
mod earthdata;
mod error;
mod h5;
mod icesat2;
mod pending;
mod provisioning;
mod record;
mod region;
mod util;
mod version;

pub use client::{
    Callbacks, Client, ClientConfig, InitOptions, Protocol, RecordCallback, Response,
};
pub use earthdata::{CMR_URL, DEFAULT_MAX_RESOURCES};
pub use error::SlideruleError;
pub use h5::{ALL_ROWS, H5Dataset, ValueType, decode_values};
pub use icesat2::{Atl06Parms, SignalConfidence, SurfaceType};
pub use pending::Pending;
pub use record::{
    DefinitionSource, FieldDef, FieldType, FieldValue, RawRecord, Record, RecordDefinition,
    RecordStreamParser, decode_record,
};
pub use region::{Coordinate, counter_clockwise, to_region};
