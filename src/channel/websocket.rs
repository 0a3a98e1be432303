//! WebSocket transport for the duplex channel

use axum::extract::ws::{Message, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};

use super::Frame;

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Split an upgraded socket into a frame stream and a frame sink
pub fn split(
    socket: WebSocket,
) -> (
    impl Stream<Item = Result<Frame, axum::Error>> + Unpin + Send + 'static,
    impl Sink<Frame, Error = axum::Error> + Unpin + Send + 'static,
) {
    let (sink, stream) = socket.split();
    let stream = stream.map(|message| message.map(Frame::from));
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::from(frame))));
    (stream, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_mapping() {
        assert_eq!(Frame::from(Message::Text("hi".into())), Frame::Text("hi".into()));
        assert_eq!(Frame::from(Message::Binary(vec![0])), Frame::Binary(vec![0]));
        assert_eq!(Frame::from(Message::Close(None)), Frame::Close);
        assert!(matches!(Message::from(Frame::Ping(vec![])), Message::Ping(_)));
        assert!(matches!(Message::from(Frame::Close), Message::Close(None)));
    }
}
