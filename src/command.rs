//! Command FIFO and button event types.
//!
//! The single wire between the RPC/UI surface and the activity state
//! machine: a bounded channel with drop-newest-on-overflow semantics, so
//! producers never block. Button and UI events are idempotent, which is
//! what makes dropping on overflow acceptable.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::COMMAND_FIFO_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPress {
    LongPressStart,
    LongPressFail,
    LongPress,
    Pressed1x,
    Pressed2x,
    Pressed3x,
    Pressed4x,
    Pressed5x,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Stop { success: bool },
    Reflow,
    SensorBake { watts: f32 },
    AdrcTest { temperature: f32 },
    StepResponse { watts: f32 },
    BondOff,
    Button(ButtonPress),
}

/// Bounded command FIFO. `try_send`'s overflow is swallowed by `post` so
/// producers never block; the consumer drains with a blocking `recv`.
pub struct CommandFifo {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl CommandFifo {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(COMMAND_FIFO_CAPACITY);
        CommandFifo { tx, rx }
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender { tx: self.tx.clone() }
    }

    pub fn receiver(&self) -> Receiver<Command> {
        self.rx.clone()
    }
}

impl Default for CommandFifo {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    /// Posts a command, dropping it (and logging) on overflow rather than
    /// blocking the producer.
    pub fn post(&self, command: Command) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(command) {
            log::warn!("command fifo full, dropping command");
        }
    }
}
