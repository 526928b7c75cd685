#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-uow** – Unit-of-Work strategies (SPEC_FULL.md §4.3).
//!
//! A unit of work accumulates messages produced inside one handler invocation and hands them to
//! the work coordinator (`conduit-coordinator`, C4) at flush time. Three strategies ship, all
//! implementing [`UnitOfWork`]: [`immediate::ImmediateUnitOfWork`], [`scoped::ScopedUnitOfWork`],
//! and [`interval::IntervalUnitOfWork`].

pub mod immediate;
pub mod interval;
pub mod scoped;

use async_trait::async_trait;
use conduit_store_core::{NewInboxItem, NewOutboxItem};
use conduit_types::{ConduitError, MessageId};
use thiserror::Error;

pub use immediate::ImmediateUnitOfWork;
pub use interval::IntervalUnitOfWork;
pub use scoped::ScopedUnitOfWork;

/// Identifier of one unit of work. Time-ordered (backed by a [`MessageId`]) per SPEC_FULL §4.3's
/// invariant that `unit_id`s are time-ordered.
pub type UnitId = MessageId;

/// Stage hint a handler attaches when queueing a message, analogous to the dispatch table's
/// per-handler `stage` ordering (`conduit_types::registry::RegisteredHandler::stage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LifecycleStage(pub u32);

/// One message queued into a unit of work: either a brand-new outbox row or a brand-new inbox
/// row. Completions/failures/renewals are not modeled here — those are reported directly against
/// the coordinator by the workers that observe them (C5–C8), not accumulated in a UoW.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedItem {
    /// A new outbox row to be inserted on flush.
    Outbox(NewOutboxItem),
    /// A new inbox row to be inserted on flush.
    Inbox(NewInboxItem),
}

/// The batch of items a unit of work hands to its [`WorkSink`] at flush time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuedWork {
    /// New outbox rows.
    pub new_outbox: Vec<NewOutboxItem>,
    /// New inbox rows.
    pub new_inbox: Vec<NewInboxItem>,
}

impl QueuedWork {
    /// True if there is nothing to flush.
    pub fn is_empty(&self) -> bool {
        self.new_outbox.is_empty() && self.new_inbox.is_empty()
    }

    fn push(&mut self, item: QueuedItem) {
        match item {
            QueuedItem::Outbox(o) => self.new_outbox.push(o),
            QueuedItem::Inbox(i) => self.new_inbox.push(i),
        }
    }
}

/// Errors a unit of work can report.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UowError {
    /// Queueing or flushing was attempted after [`UnitOfWork::dispose`].
    #[error("unit of work disposed")]
    Disposed,
    /// No such unit is currently open.
    #[error("unknown unit id")]
    UnknownUnit,
    /// The downstream sink rejected the flush.
    #[error("sink error: {0}")]
    Sink(ConduitError),
}

/// Accepts flushed work from a unit of work. Implemented by `conduit_coordinator`'s coordinator
/// strategies — a UoW never talks to the store directly.
#[async_trait]
pub trait WorkSink: Send + Sync {
    /// Accept one flushed batch. Strategies decide independently whether this triggers an
    /// immediate `process_work_batch` round trip or is merely buffered.
    async fn accept(&self, batch: QueuedWork) -> Result<(), ConduitError>;
}

/// Contract shared by all unit-of-work strategies (SPEC_FULL §4.3).
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Queue one message under a (possibly pre-existing) unit, returning the unit id it was
    /// queued under. `stage` is an optional ordering hint passed through for the caller's own
    /// bookkeeping; the UoW itself does not reorder messages by stage.
    async fn queue(&self, item: QueuedItem, stage: Option<LifecycleStage>) -> Result<UnitId, UowError>;

    /// Cancel a unit: discard any buffered, not-yet-flushed messages for it. A no-op if the unit
    /// has already flushed (SPEC_FULL §4.3 invariant).
    async fn cancel(&self, unit_id: UnitId) -> Result<(), UowError>;

    /// Force `unit_id` to flush now, regardless of the strategy's normal trigger.
    async fn flush(&self, unit_id: UnitId) -> Result<(), UowError>;

    /// Flush any pending state and refuse further queueing.
    async fn dispose(&self) -> Result<(), UowError>;
}
