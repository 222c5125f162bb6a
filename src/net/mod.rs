//! Network collaborators: HTTP transport, simulator messaging, region lookup

pub mod http;
pub mod reqwest_transport;
pub mod sim;
pub mod region;

pub use http::{ByteRange, ContentRange, HttpGet, HttpHandle, HttpResponse, HttpStatus, HttpTransport};
pub use reqwest_transport::ReqwestTransport;
pub use sim::{ImageRequest, SimulatorMessenger};
pub use region::{RegionLookup, StaticRegionTable};
