pub mod executor;
pub mod message;
pub mod processors;
pub mod sinks;

use message::Message;
use tokio::sync::mpsc;

pub use executor::{Pipeline, PipelineBuilder};

pub type MessageSender = mpsc::Sender<Message>;
pub type MessageReceiver = mpsc::Receiver<Message>;

pub fn create_message_channel(buffer_size: usize) -> (MessageSender, MessageReceiver) {
    mpsc::channel(buffer_size)
}
