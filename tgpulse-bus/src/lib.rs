mod coordinator;
mod envelope;
mod streams;

pub use coordinator::{Coordinator, RateDecision};
pub use envelope::{
    AlbumParsed, DecodeError, DigestGenerate, Envelope, EventPayload, PostEnriched, PostIndexed,
    PostParsed, PostTagged, PostVision, TrendEmerging, parse_schema,
};
pub use streams::{BusError, PendingEntry, StreamBus, StreamMessage, dlq_key, stream_key};
