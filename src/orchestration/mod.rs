pub mod page_sequencer;

pub use page_sequencer::{PageInput, PageOutput, PageSequencer};
