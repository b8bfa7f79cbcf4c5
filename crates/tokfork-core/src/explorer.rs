//! Consumer side of a generation session.
//!
//! The explorer owns the branch tree, the frontier (the node new tokens are
//! appended after) and the root prompt. It turns session events into tree
//! nodes and computes the prompt a branch restarts from.

use std::sync::Arc;

use tracing::{debug, error};

use crate::core::events::{EndReason, SessionEvent};
use crate::core::session::{GenerationSession, SessionError, SessionEventRx};
use crate::layout::{Layout, LayoutConfig, layout};
use crate::settings::SampleSettings;
use crate::tree::{BranchTree, NewNode, NodeId, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum ExploreError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Default)]
pub struct Explorer {
    tree: BranchTree,
    layout: Layout,
    layout_config: LayoutConfig,
    settings: SampleSettings,
    root_prompt: String,
    frontier: Option<NodeId>,
    last_end: Option<EndReason>,
    apply_error: Option<TreeError>,
}

impl Explorer {
    pub fn new(settings: SampleSettings, layout_config: LayoutConfig) -> Self {
        Self {
            layout_config,
            settings,
            ..Self::default()
        }
    }

    /// Starts a fresh exploration and returns the prompt to generate from.
    pub fn begin(&mut self, prompt: impl Into<String>) -> String {
        self.tree.clear();
        self.frontier = None;
        self.last_end = None;
        self.apply_error = None;
        self.root_prompt = prompt.into();
        self.relayout();
        self.root_prompt.clone()
    }

    /// Applies one session event to the tree.
    ///
    /// # Errors
    /// Returns an error if the node cannot be placed after the frontier.
    pub fn apply(&mut self, event: &SessionEvent) -> Result<(), TreeError> {
        match event {
            SessionEvent::StepProduced { candidates, .. } => {
                let new = match self.frontier.and_then(|id| self.tree.node(id)) {
                    Some(frontier) => NewNode {
                        depth: frontier.depth,
                        lane: frontier.lane + 1,
                        prefix: format!("{}{}", frontier.prefix, frontier.text()),
                        candidates: Arc::clone(candidates),
                        parent: Some(frontier.id),
                        diverged_from: None,
                    },
                    None => NewNode {
                        depth: 0,
                        lane: 0,
                        prefix: String::new(),
                        candidates: Arc::clone(candidates),
                        parent: None,
                        diverged_from: None,
                    },
                };
                self.frontier = Some(self.tree.append_node(new)?);
                self.relayout();
            }
            SessionEvent::SessionEnded { reason } => {
                self.last_end = Some(reason.clone());
            }
        }
        Ok(())
    }

    /// Applies events until the session ends or the channel closes.
    ///
    /// A step that cannot be placed does not stop the drain. The first such
    /// error is kept for [`Explorer::take_apply_error`].
    pub async fn drain(&mut self, rx: &mut SessionEventRx) -> Option<EndReason> {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.apply(&event) {
                error!("step could not be placed: {err}");
                self.apply_error.get_or_insert(err);
            }
            if let SessionEvent::SessionEnded { reason } = event {
                return Some(reason);
            }
        }
        None
    }

    /// Forks `node` at `candidate_index` and moves the frontier to the fork.
    ///
    /// Returns the prompt generation restarts from.
    ///
    /// # Errors
    /// Returns `UnknownNode` or `CandidateOutOfRange`.
    pub fn branch(
        &mut self,
        node: NodeId,
        candidate_index: usize,
        text: impl Into<String>,
    ) -> Result<String, TreeError> {
        let text = text.into();
        let id = self.tree.branch(node, candidate_index, text.clone())?;
        self.frontier = Some(id);
        self.last_end = None;
        self.relayout();
        let prefix = self.tree.node(id).map_or("", |n| n.prefix.as_str());
        debug!(%node, candidate_index, "branched");
        Ok(format!("{}{prefix}{text}", self.root_prompt))
    }

    /// Stops the session, branches and starts the session again.
    ///
    /// Events still queued on `running` are applied first. Without it the
    /// running branch is cancelled and its remaining events are discarded.
    ///
    /// # Errors
    /// Returns tree errors for bad branch targets and session errors when the
    /// candidate cannot be decoded or generation cannot start.
    pub async fn restart_from(
        &mut self,
        session: &mut GenerationSession,
        running: Option<SessionEventRx>,
        node: NodeId,
        candidate_index: usize,
    ) -> Result<SessionEventRx, ExploreError> {
        if let Some(mut rx) = running {
            session.stop();
            self.drain(&mut rx).await;
        }
        if session.is_running() {
            session.stop();
        }
        session.wait().await;

        let candidates = self
            .tree
            .node(node)
            .map(|n| Arc::clone(&n.candidates))
            .ok_or(TreeError::UnknownNode(node))?;
        if candidate_index >= candidates.len() {
            return Err(TreeError::CandidateOutOfRange {
                index: candidate_index,
                len: candidates.len(),
            }
            .into());
        }
        let text = session.decode_candidate(&candidates, candidate_index)?;
        let prompt = self.branch(node, candidate_index, text)?;
        Ok(session.start(prompt, self.settings.clone())?)
    }

    pub fn toggle_expanded(&mut self, id: NodeId) -> Result<bool, TreeError> {
        let expanded = self.tree.toggle_expanded(id)?;
        self.relayout();
        Ok(expanded)
    }

    /// Full response text up to and including `id`.
    pub fn response_text(&self, id: NodeId) -> Option<String> {
        self.tree
            .node(id)
            .map(|n| format!("{}{}", n.prefix, n.text()))
    }

    pub fn root_prompt(&self) -> &str {
        &self.root_prompt
    }

    pub fn frontier(&self) -> Option<NodeId> {
        self.frontier
    }

    pub fn last_end(&self) -> Option<&EndReason> {
        self.last_end.as_ref()
    }

    /// First step that [`Explorer::drain`] failed to place since the last call.
    pub fn take_apply_error(&mut self) -> Option<TreeError> {
        self.apply_error.take()
    }

    pub fn tree(&self) -> &BranchTree {
        &self.tree
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn settings(&self) -> &SampleSettings {
        &self.settings
    }

    /// Replaces the settings used by the next restart. Running branches keep
    /// the snapshot they started with.
    pub fn set_settings(&mut self, settings: SampleSettings) {
        self.settings = settings;
    }

    fn relayout(&mut self) {
        self.layout = layout(&self.tree, &self.layout_config);
    }
}
