//! COPY streaming bridges.

pub mod copy_in;
pub mod copy_out;

pub use copy_in::CopyInSink;
pub use copy_out::CopyOutStream;
