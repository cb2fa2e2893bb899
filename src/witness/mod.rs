//! Witness assembly: the data model and the FlowPairer that turns ordered
//! `ParsedUnit`s into paired `Witness`es.

pub mod model;
pub mod pairer;

pub use model::{
    ClientRegistration, ConnectionEndState, ConnectionID, ConnectionSummary, Direction, Headers,
    HttpRequest, HttpResponse, ParsedUnit, ParsedUnitKind, Service, StreamSegment,
    TcpPacketFlags, TlsHandshakeMeta, Trace, Witness, WitnessSide,
};
pub use pairer::FlowPairer;
