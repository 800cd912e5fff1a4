pub mod frame_buffer;

pub use frame_buffer::{BufferStats, FrameBuffer};
