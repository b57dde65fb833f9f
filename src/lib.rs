#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod aggregate;
mod config;
mod error;
mod instance;
mod message;
mod participant;
mod repository;
mod retry;
mod state;
mod system;

pub mod runner;
pub mod storage;

pub use crate::aggregate::{Aggregate, Event, Input};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::instance::{Instance, Phase};
pub use crate::message::{Message, ProposalId};
pub use crate::participant::{Participant, Upstream};
pub use crate::repository::{Applied, Repository};
pub use crate::retry::Backoff;
pub use crate::state::{Identifier, NodeId, PipelineId, Value};
pub use crate::system::System;
