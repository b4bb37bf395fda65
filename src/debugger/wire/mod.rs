//! Debug server wire protocol: ASCII command lines, mixed text and binary responses.

pub mod codec;
pub mod machine;
pub mod proto;
pub mod transport;
