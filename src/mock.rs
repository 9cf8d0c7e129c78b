//! Scripted transport, pins and delay for unit tests, sharing one event log

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;

use crate::gpio::{BootPins, Direction, Level, Line};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub struct MockError(pub &'static str);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Write(Vec<u8>),
    Close,
    Level(Line, Level),
    Direction(Line, Direction),
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    delays: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Inner>>);

impl Log {
    fn push(&self, e: Event) {
        self.0.borrow_mut().events.push(e);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().events.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Events from the last occurrence of `e` onwards
    pub fn tail_from(&self, e: &Event) -> Vec<Event> {
        let events = self.events();
        match events.iter().rposition(|x| x == e) {
            Some(i) => events[i..].to_vec(),
            None => vec![],
        }
    }

    pub fn delays(&self) -> Vec<u32> {
        self.0.borrow().delays.clone()
    }

    pub fn delayed_ms(&self) -> u32 {
        self.0.borrow().delays.iter().sum()
    }
}

pub struct MockTransport {
    log: Log,
    replies: VecDeque<Vec<Vec<u8>>>,
    inbound: VecDeque<Vec<u8>>,
    fail_open: bool,
    fail_writes: bool,
    fail_close: bool,
    read_wait: u32,
}

impl MockTransport {
    pub fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            replies: VecDeque::new(),
            inbound: VecDeque::new(),
            fail_open: false,
            fail_writes: false,
            fail_close: false,
            read_wait: 0,
        }
    }

    /// Queue a reply, delivered as these chunks after the next unanswered write
    pub fn reply(&mut self, chunks: &[&[u8]]) {
        self.replies
            .push_back(chunks.iter().map(|c| c.to_vec()).collect());
    }

    /// Deliver the next queued reply without waiting for a write
    pub fn release(&mut self) {
        if let Some(r) = self.replies.pop_front() {
            self.inbound.extend(r);
        }
    }

    /// Make a chunk readable immediately
    pub fn inject(&mut self, chunk: &[u8]) {
        self.inbound.push_back(chunk.to_vec());
    }

    /// Chunks received but not yet read
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Simulate a tty read timeout, logged as a delay on every empty read
    pub fn set_read_wait(&mut self, ms: u32) {
        self.read_wait = ms;
    }

    pub fn fail_open(&mut self) {
        self.fail_open = true;
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    pub fn fail_close(&mut self) {
        self.fail_close = true;
    }
}

impl Transport for MockTransport {
    type Error = MockError;

    fn open(&mut self) -> Result<(), MockError> {
        if self.fail_open {
            return Err(MockError("open"));
        }
        self.log.push(Event::Open);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), MockError> {
        if self.fail_writes {
            return Err(MockError("write"));
        }
        self.log.push(Event::Write(data.to_vec()));
        self.release();
        Ok(())
    }

    fn read(&mut self, buff: &mut [u8]) -> nb::Result<usize, MockError> {
        let chunk = match self.inbound.pop_front() {
            Some(c) => c,
            None => {
                if self.read_wait > 0 {
                    self.log.0.borrow_mut().delays.push(self.read_wait);
                }
                return Err(nb::Error::WouldBlock);
            }
        };
        let n = chunk.len().min(buff.len());
        buff[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn read_wait_ms(&self) -> u32 {
        self.read_wait
    }

    fn close(&mut self) -> Result<(), MockError> {
        if self.fail_close {
            return Err(MockError("close"));
        }
        self.inbound.clear();
        self.log.push(Event::Close);
        Ok(())
    }
}

pub struct MockPins {
    log: Log,
    fail_on: Option<(Line, Level)>,
}

impl MockPins {
    pub fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            fail_on: None,
        }
    }

    /// Fail whenever `line` is set to `level`
    pub fn fail_on(&mut self, line: Line, level: Level) {
        self.fail_on = Some((line, level));
    }
}

impl BootPins for MockPins {
    type Error = MockError;

    fn set_level(&mut self, line: Line, level: Level) -> Result<(), MockError> {
        if self.fail_on == Some((line, level)) {
            return Err(MockError("pin"));
        }
        self.log.push(Event::Level(line, level));
        Ok(())
    }

    fn set_direction(&mut self, line: Line, direction: Direction) -> Result<(), MockError> {
        self.log.push(Event::Direction(line, direction));
        Ok(())
    }
}

pub struct MockDelay {
    log: Log,
}

impl MockDelay {
    pub fn new(log: &Log) -> Self {
        Self { log: log.clone() }
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.log.0.borrow_mut().delays.push(ms);
    }
}
