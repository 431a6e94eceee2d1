//! Console capture for running scripts.

use std::sync::{Mutex, PoisonError};

use crate::result::{OutputStream, ResultEvent};

use super::streamer::ResultQueue;

/// Line-buffered writer that turns console output into `Output` events.
///
/// One instance exists per stream per execution, so a partial line can
/// never leak into a later submission. The running script writes through
/// it instead of the process's real stdout/stderr.
pub struct OutputWriter {
    stream: OutputStream,
    queue: ResultQueue,
    buffer: Mutex<String>,
}

impl OutputWriter {
    pub fn new(stream: OutputStream, queue: ResultQueue) -> Self {
        Self {
            stream,
            queue,
            buffer: Mutex::new(String::new()),
        }
    }

    /// Buffer `text` and emit every completed line.
    pub fn write(&self, text: &str) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_str(text);

        while let Some(newline) = buffer.find('\n') {
            let mut line: String = buffer.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.emit(line);
        }
    }

    /// Emit any partial line still buffered.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if !buffer.is_empty() {
            let line = std::mem::take(&mut *buffer);
            self.emit(line);
        }
    }

    fn emit(&self, text: String) {
        self.queue.enqueue(ResultEvent::Output {
            stream: self.stream,
            text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use crate::ipc::{Frame, FrameReceiver, Push, PushSender};
    use crate::worker::streamer::ResultStreamer;

    fn texts(rx: &mut FrameReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Frame::Push {
            body: Push::Dump(events),
        }) = rx.try_recv()
        {
            for event in events {
                if let ResultEvent::Output { text, .. } = event {
                    out.push(text);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_lines_and_partial_flush() {
        let (push, mut rx) = PushSender::pair();
        let streamer = ResultStreamer::spawn(StreamerConfig::default(), push);
        let writer = OutputWriter::new(OutputStream::Stdout, streamer.queue());

        let flush = streamer.begin();
        writer.write("hello ");
        writer.write("world\r\nsecond\nthi");
        writer.write("rd");
        writer.flush();
        writer.flush();
        flush.finish().await;

        assert_eq!(texts(&mut rx), ["hello world", "second", "third"]);
    }
}
