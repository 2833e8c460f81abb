//! One-shot RPC wrapper APIs scoped to a session.
//!
//! Thin typed surfaces over the correlation engine; every call re-checks the
//! session guard first.

use serde::Deserialize;
use serde_json::json;

use crate::error::SdkResult;
use crate::session::Session;
use crate::types::{AgentInfo, CompactResult};

/// Agent selection and management for one session.
///
/// Reached via [`Session::agent`].
#[derive(Debug)]
pub struct AgentApi<'a> {
    session: &'a Session,
}

#[derive(Debug, Default, Deserialize)]
struct AgentListResult {
    #[serde(default)]
    agents: Vec<AgentInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentResult {
    #[serde(default)]
    agent: Option<AgentInfo>,
}

impl<'a> AgentApi<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// List the custom agents available in this session.
    ///
    /// # Errors
    ///
    /// [`crate::SdkError::SessionClosed`] after close, or the underlying RPC
    /// error.
    pub async fn list(&self) -> SdkResult<Vec<AgentInfo>> {
        self.session.ensure_open()?;
        let result: AgentListResult = self
            .session
            .rpc()
            .invoke(
                "session.agent.list",
                json!({"sessionId": self.session.session_id()}),
            )
            .await?;
        Ok(result.agents)
    }

    /// The currently selected agent, if any.
    ///
    /// # Errors
    ///
    /// [`crate::SdkError::SessionClosed`] after close, or the underlying RPC
    /// error.
    pub async fn current(&self) -> SdkResult<Option<AgentInfo>> {
        self.session.ensure_open()?;
        let result: AgentResult = self
            .session
            .rpc()
            .invoke(
                "session.agent.getCurrent",
                json!({"sessionId": self.session.session_id()}),
            )
            .await?;
        Ok(result.agent)
    }

    /// Select an agent by name.
    ///
    /// # Errors
    ///
    /// [`crate::SdkError::SessionClosed`] after close, or the underlying RPC
    /// error.
    pub async fn select(&self, name: &str) -> SdkResult<Option<AgentInfo>> {
        self.session.ensure_open()?;
        let result: AgentResult = self
            .session
            .rpc()
            .invoke(
                "session.agent.select",
                json!({"sessionId": self.session.session_id(), "name": name}),
            )
            .await?;
        Ok(result.agent)
    }

    /// Deselect the active agent, reverting to the default.
    ///
    /// # Errors
    ///
    /// [`crate::SdkError::SessionClosed`] after close, or the underlying RPC
    /// error.
    pub async fn deselect(&self) -> SdkResult<()> {
        self.session.ensure_open()?;
        self.session
            .rpc()
            .invoke_unit(
                "session.agent.deselect",
                json!({"sessionId": self.session.session_id()}),
            )
            .await?;
        Ok(())
    }
}

/// History compaction for one session.
///
/// Compaction summarizes older conversation history so long conversations
/// stay inside the context limit. Reached via [`Session::compaction`].
#[derive(Debug)]
pub struct CompactionApi<'a> {
    session: &'a Session,
}

impl<'a> CompactionApi<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Compact the session history.
    ///
    /// # Errors
    ///
    /// [`crate::SdkError::SessionClosed`] after close, or the underlying RPC
    /// error.
    pub async fn compact(&self) -> SdkResult<CompactResult> {
        self.session.ensure_open()?;
        let result = self
            .session
            .rpc()
            .invoke(
                "session.compaction.compact",
                json!({"sessionId": self.session.session_id()}),
            )
            .await?;
        Ok(result)
    }
}
