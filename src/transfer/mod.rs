pub mod codec;
pub mod engine;

pub use codec::{BodyRead, FrameReader, FrameWriter, TimeoutScope};
pub use engine::{
    discard_body, receive_entry_file, receive_file, send_file, EndSignal, TransferStats,
};
