//! Persistence for plans, turn sessions and the narrative carried between turns.

mod db;
mod models;

use anyhow::Result;
use async_trait::async_trait;

use crate::signals::Role;

pub use db::{NoteKind, PlanDb, SqliteStore};
pub use models::{Plan, PlanStatus, RawEvent, SessionStatus, TurnSession};

/// Storage consumed by the orchestrator.
///
/// Progress and learnings are append-only and only ever read back as "latest
/// for this plan". Feedback is read-then-clear.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_plan(&self, name: &str, content: &str) -> Result<Plan>;
    async fn get_plan(&self, id: i64) -> Result<Option<Plan>>;
    async fn list_plans(&self) -> Result<Vec<Plan>>;
    async fn update_plan_status(&self, id: i64, status: PlanStatus) -> Result<()>;
    async fn update_plan_base_revision(&self, id: i64, revision: &str) -> Result<()>;

    /// Session with the highest iteration for the plan.
    async fn get_latest_session(&self, plan_id: i64) -> Result<Option<TurnSession>>;
    async fn create_session(
        &self,
        plan_id: i64,
        iteration: u32,
        role: Role,
        prompt: &str,
    ) -> Result<TurnSession>;
    async fn complete_session(
        &self,
        session_id: i64,
        output: &str,
        status: SessionStatus,
    ) -> Result<()>;

    async fn get_latest_progress(&self, plan_id: i64) -> Result<Option<String>>;
    async fn get_latest_learnings(&self, plan_id: i64) -> Result<Option<String>>;
    async fn get_latest_feedback(&self, plan_id: i64) -> Result<Option<String>>;
    async fn create_progress(&self, session_id: i64, content: &str) -> Result<()>;
    async fn create_learnings(&self, session_id: i64, content: &str) -> Result<()>;
    async fn create_feedback(&self, plan_id: i64, session_id: i64, content: &str) -> Result<()>;
    async fn clear_feedback(&self, plan_id: i64) -> Result<()>;

    async fn create_raw_event(&self, session_id: i64, seq: u64, kind: &str, raw: &str)
    -> Result<()>;
}
