//! Controller-worker bridge: wire types, bulk-data codec and file channel.

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{BulkChannel, RecoveryRecord, SessionFiles};
pub use codec::{CodecError, FormatVersion, PayloadCodec};
pub use protocol::{ConfigureQuery, Fault, Handshake, Metadata};
