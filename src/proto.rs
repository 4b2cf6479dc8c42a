//! Generated protobuf types for the control channel.

/// Messages declared in `proto/Mumble.proto`.
#[allow(clippy::all)]
pub mod mumble {
    include!(concat!(env!("OUT_DIR"), "/mumble_proto.rs"));
}
