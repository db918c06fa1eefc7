//! Single-Slot Request Mailbox
//!
//! # Overview
//!
//! The handoff between prompt producers and the one inference worker: a
//! mutex-guarded slot holding at most one pending (prompt, response)
//! pair, with a condition variable as the waker. There is no queue —
//! concurrent submitters race for the slot and losers get `Busy`.
//!
//! # State Machine
//!
//! ```text
//! Idle ──submit──▶ Pending ──claim──▶ Running ──complete──▶ Idle
//!                     │                  │
//!                     └────── shutdown ──┴──▶ ShutDown (drains as Cancelled)
//! ```
//!
//! # Ordering Guarantees
//!
//! The mutex plus condvar establish: *submit writes prompt* →
//! *worker reads prompt* → *worker writes response* → *await reads
//! response*. `submit` never blocks; `await_response` blocks up to an
//! explicit deadline and returns `Timeout` without disturbing the worker.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{LlmError, LlmResult};

/// Prompts beyond this many bytes are truncated at submission
pub const MAX_PROMPT_LEN: usize = 511;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Pending,
    Running,
    ShutDown,
}

struct Slot {
    state: SlotState,
    prompt: String,
    last_response: Option<String>,
}

/// Mutex-guarded single-slot handoff with a blocking waker
pub struct Mailbox {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                prompt: String::new(),
                last_response: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Producer side: place a prompt in the slot and wake the worker
    ///
    /// Returns `Busy` when a request is already pending or running. The
    /// previous response is cleared. Over-long prompts are truncated at a
    /// character boundary.
    pub fn submit(&self, prompt: &str) -> LlmResult<()> {
        let mut slot = self.slot.lock();
        match slot.state {
            SlotState::Idle => {}
            SlotState::ShutDown => return Err(LlmError::Cancelled),
            SlotState::Pending | SlotState::Running => return Err(LlmError::Busy),
        }

        let mut end = prompt.len().min(MAX_PROMPT_LEN);
        while end > 0 && !prompt.is_char_boundary(end) {
            end -= 1;
        }
        slot.prompt.clear();
        slot.prompt.push_str(&prompt[..end]);
        slot.last_response = None;
        slot.state = SlotState::Pending;
        drop(slot);

        self.cond.notify_all();
        Ok(())
    }

    /// Worker side: block until a request is pending, claim it
    ///
    /// Returns `None` once the mailbox shuts down.
    pub fn wait_for_request(&self) -> Option<String> {
        let mut slot = self.slot.lock();
        loop {
            match slot.state {
                SlotState::Pending => {
                    slot.state = SlotState::Running;
                    return Some(slot.prompt.clone());
                }
                SlotState::ShutDown => return None,
                _ => self.cond.wait(&mut slot),
            }
        }
    }

    /// Worker side: publish the response and free the slot
    pub fn complete(&self, response: String) {
        let mut slot = self.slot.lock();
        slot.last_response = Some(response);
        if slot.state == SlotState::Running {
            slot.state = SlotState::Idle;
        }
        drop(slot);
        self.cond.notify_all();
    }

    /// Consumer side: wait up to `timeout` for the in-flight request
    ///
    /// `Ok(None)` means the mailbox is idle with nothing published yet.
    /// `Timeout` leaves the worker untouched; the request keeps running.
    pub fn await_response(&self, timeout: Duration) -> LlmResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            match slot.state {
                SlotState::Idle => return Ok(slot.last_response.clone()),
                SlotState::ShutDown => return Err(LlmError::Cancelled),
                SlotState::Pending | SlotState::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LlmError::Timeout);
                    }
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        return Err(LlmError::Timeout);
                    }
                }
            }
        }
    }

    /// Whether a request is pending or running
    pub fn is_busy(&self) -> bool {
        matches!(
            self.slot.lock().state,
            SlotState::Pending | SlotState::Running
        )
    }

    /// Last published response, without blocking
    pub fn last_response(&self) -> Option<String> {
        self.slot.lock().last_response.clone()
    }

    /// Drain the slot and release the worker
    ///
    /// A pending or running request is abandoned with a cancelled notice
    /// in the response buffer.
    pub fn shutdown(&self) {
        let mut slot = self.slot.lock();
        if matches!(slot.state, SlotState::Pending | SlotState::Running) {
            slot.last_response = Some("request cancelled by shutdown".to_string());
        }
        slot.state = SlotState::ShutDown;
        drop(slot);
        self.cond.notify_all();
    }
}
