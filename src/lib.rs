//! Serialized, sandboxed execution of git commands.
//!
//! Commands for the same working directory run one at a time through a
//! [`sequencer::Sequencer`]. They execute either in-process or in a pool of
//! sandbox host processes ([`pool::WorkerPool`]) that is rotated as spawning
//! slows down. Credential prompts raised by the tool are relayed to the
//! embedding application over a one-shot local socket ([`prompt`]).

pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod prompt;
pub mod sandbox;
pub mod sequencer;
