//! Ledger Adapter Port
//!
//! The core depends on the distributed ledger only through the [`LedgerApi`]
//! trait. The concrete driver (JSON API over HTTP + WebSocket streams) lives
//! in [`json_api`] and [`stream`]; payload-shape normalisation happens in
//! [`codec`] so that consumers only ever see the flat
//! `{contract_id, template_id, payload}` record.

pub mod codec;
pub mod error;
pub mod json_api;
pub mod retry;
pub mod stream;
pub mod token;

pub use error::LedgerError;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt;

/// Hard cap the ledger applies to REST active-contract queries. Assumed
/// pessimistically: a page of exactly this size may be truncated.
pub const REST_PAGE_CAP: usize = 200;

/// Opaque, monotonically-increasing position marker on the update stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Offset(pub String);

impl Offset {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contract templates the core projects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    Order,
    Trade,
    Allocation,
}

impl TemplateId {
    /// Qualified template name on the ledger
    pub fn qualified_name(&self) -> &'static str {
        match self {
            TemplateId::Order => "Exchange.Trading:Order",
            TemplateId::Trade => "Exchange.Trading:Trade",
            TemplateId::Allocation => "Exchange.Settlement:AllocationInstruction",
        }
    }

    pub fn from_qualified_name(name: &str) -> Option<Self> {
        match name {
            "Exchange.Trading:Order" => Some(TemplateId::Order),
            "Exchange.Trading:Trade" => Some(TemplateId::Trade),
            "Exchange.Settlement:AllocationInstruction" => Some(TemplateId::Allocation),
            _ => None,
        }
    }

    pub const ALL: [TemplateId; 3] = [TemplateId::Order, TemplateId::Trade, TemplateId::Allocation];
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// A normalised active contract as seen by every consumer of the port
#[derive(Debug, Clone)]
pub struct ActiveContract {
    pub contract_id: String,
    pub template_id: TemplateId,
    pub payload: Value,
}

/// One element of the live update stream
#[derive(Debug, Clone)]
pub enum LedgerUpdate {
    Created {
        contract: ActiveContract,
        offset: Offset,
    },
    Archived {
        contract_id: String,
        template_id: TemplateId,
        offset: Offset,
    },
}

impl LedgerUpdate {
    pub fn offset(&self) -> &Offset {
        match self {
            LedgerUpdate::Created { offset, .. } => offset,
            LedgerUpdate::Archived { offset, .. } => offset,
        }
    }
}

/// Result of a committed ledger transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub created: Vec<ActiveContract>,
    pub archived: Vec<String>,
}

impl TransactionResult {
    /// First created contract of the given template, if any
    pub fn created_contract(&self, template: TemplateId) -> Option<&ActiveContract> {
        self.created.iter().find(|c| c.template_id == template)
    }
}

/// A create-or-exercise command submitted to the ledger
#[derive(Debug, Clone)]
pub enum LedgerCommand {
    Create {
        template: TemplateId,
        payload: Value,
    },
    Exercise {
        template: TemplateId,
        contract_id: String,
        choice: String,
        argument: Value,
    },
}

impl LedgerCommand {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            LedgerCommand::Create { template, .. } => format!("create {}", template),
            LedgerCommand::Exercise {
                template,
                contract_id,
                choice,
                ..
            } => format!("exercise {}.{} on {}", template, choice, contract_id),
        }
    }
}

/// Abstract port to the distributed ledger
///
/// A conformant implementation preserves: (a) at-most-once effect of a
/// successfully-returned command; (b) monotonic per-party offsets in update
/// streams; (c) archived contracts are absent from subsequent active queries.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// Submit a create-or-exercise command and wait for the commit
    async fn submit_command(
        &self,
        act_as: &[String],
        read_as: &[String],
        command: LedgerCommand,
    ) -> Result<TransactionResult, LedgerError>;

    /// Query active contracts over REST. At most `page_size` elements are
    /// returned and [`REST_PAGE_CAP`] applies regardless of `page_size`.
    async fn query_active(
        &self,
        party: &str,
        templates: &[TemplateId],
        page_size: usize,
    ) -> Result<Vec<ActiveContract>, LedgerError>;

    /// Finite bootstrap stream of all contracts active at `offset`.
    /// Not restartable; the consumer resumes by re-subscribing.
    async fn stream_active_at_offset(
        &self,
        offset: &Offset,
        templates: &[TemplateId],
    ) -> Result<BoxStream<'static, Result<ActiveContract, LedgerError>>, LedgerError>;

    /// Infinite live subscription from `from_offset` (exclusive)
    async fn stream_updates(
        &self,
        from_offset: &Offset,
        templates: &[TemplateId],
    ) -> Result<BoxStream<'static, Result<LedgerUpdate, LedgerError>>, LedgerError>;

    /// Execute the transfer previously authorised by an allocation.
    /// The executor is the exchange party; no user key is required.
    async fn execute_allocation(
        &self,
        allocation_ref: &str,
        executor: &str,
        owner_hint: &str,
    ) -> Result<TransactionResult, LedgerError>;

    /// Release an unexecuted allocation back to its owner
    async fn withdraw_allocation(
        &self,
        allocation_ref: &str,
        owner: &str,
    ) -> Result<TransactionResult, LedgerError>;

    /// Fresh snapshot offset for bootstrap streaming
    async fn get_ledger_end(&self) -> Result<Offset, LedgerError>;

    /// Available (unlocked) holdings of `party` in `asset`
    async fn get_available_balance(&self, party: &str, asset: &str)
        -> Result<Decimal, LedgerError>;
}
