// In-memory controller used by the unit tests.
// Answers every complete frame from a reply table keyed on the frame's
// first character (default "0"), and records what was written.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use super::controller::{TERMINATOR, Transport};

/// Frames from several mocks in the order they hit the wire, as "label: frame"
pub type Journal = Rc<RefCell<Vec<String>>>;

#[derive(Default)]
struct State {
    label: String,
    journal: Option<Journal>,
    partial: Vec<u8>,
    frames: Vec<String>,
    rx: VecDeque<u8>,
    replies: HashMap<char, Option<Vec<u8>>>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log every frame into a journal shared with other mocks
    pub fn with_journal(journal: &Journal, label: &str) -> Self {
        let mock = Self::new();
        {
            let mut state = mock.state.borrow_mut();
            state.label = label.to_string();
            state.journal = Some(journal.clone());
        }
        mock
    }

    /// Answer frames starting with `key` with `body` plus the terminator
    pub fn reply(&self, key: char, body: &str) {
        let mut raw = body.as_bytes().to_vec();
        raw.extend_from_slice(TERMINATOR);
        self.state.borrow_mut().replies.insert(key, Some(raw));
    }

    /// Answer frames starting with `key` with exactly these bytes
    pub fn raw_reply(&self, key: char, raw: &str) {
        self.state
            .borrow_mut()
            .replies
            .insert(key, Some(raw.as_bytes().to_vec()));
    }

    /// Never answer frames starting with `key`
    pub fn silence(&self, key: char) {
        self.state.borrow_mut().replies.insert(key, None);
    }

    /// Put unsolicited bytes into the receive buffer
    pub fn inject(&self, raw: &str) {
        self.state.borrow_mut().rx.extend(raw.bytes());
    }

    /// Every frame written so far, without terminators
    pub fn frames(&self) -> Vec<String> {
        self.state.borrow().frames.clone()
    }

    pub fn clear_frames(&self) {
        self.state.borrow_mut().frames.clear();
    }
}

impl State {
    fn on_frame(&mut self, frame: String) {
        let key = frame.chars().next().unwrap_or(' ');
        let reply = match self.replies.get(&key) {
            Some(reply) => reply.clone(),
            None => Some(b"0\r\n\r\n".to_vec()),
        };
        if let Some(reply) = reply {
            self.rx.extend(reply);
        }
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push(format!("{}: {}", self.label, frame));
        }
        self.frames.push(frame);
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.partial.extend_from_slice(buf);
        loop {
            let Some(end) = state
                .partial
                .windows(TERMINATOR.len())
                .position(|w| w == TERMINATOR)
            else {
                break;
            };
            let frame: Vec<u8> = state.partial.drain(..end + TERMINATOR.len()).collect();
            let text = String::from_utf8_lossy(&frame[..end]).into_owned();
            state.on_frame(text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.state.borrow_mut().rx.clear();
        Ok(())
    }
}
