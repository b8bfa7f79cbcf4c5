//! Explore command: run a session, apply branches, print the tree.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokfork_core::config::Config;
use tokfork_core::core::{EndReason, GenerationSession, SessionEventRx};
use tokfork_core::explorer::Explorer;
use tokfork_core::fixture::FixtureLoader;
use tokfork_core::layout::Layout;
use tokfork_core::settings;
use tokfork_core::tree::{BranchTree, NodeId};
use tracing::info;

/// A `ROW:LANE:INDEX` branch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSpec {
    pub row: usize,
    pub lane: usize,
    pub index: usize,
}

impl FromStr for BranchSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [row, lane, index] = parts.as_slice() else {
            return Err(format!("expected ROW:LANE:INDEX, got '{s}'"));
        };
        let parse = |part: &str, what: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid {what} '{part}' in '{s}': {e}"))
        };
        Ok(Self {
            row: parse(*row, "row")?,
            lane: parse(*lane, "lane")?,
            index: parse(*index, "candidate index")?,
        })
    }
}

pub struct ExploreOptions<'a> {
    pub prompt: &'a str,
    pub model: Option<&'a Path>,
    pub max_samples: Option<usize>,
    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub branches: &'a [BranchSpec],
    pub json: bool,
    pub config: &'a Config,
}

#[derive(Serialize)]
struct NodeView<'a> {
    id: NodeId,
    depth: usize,
    lane: usize,
    text: &'a str,
    prefix: &'a str,
    selected: usize,
    candidates: usize,
}

#[derive(Serialize)]
struct ExploreReport<'a> {
    prompt: &'a str,
    nodes: Vec<NodeView<'a>>,
    layout: &'a Layout,
    ended: Option<&'a EndReason>,
}

pub async fn run(opts: ExploreOptions<'_>) -> Result<()> {
    let model_path: PathBuf = match (opts.model, opts.config.model_path.as_deref()) {
        (Some(path), _) | (None, Some(path)) => path.to_path_buf(),
        (None, None) => bail!("No model specified. Pass --model or set model_path in config.toml"),
    };

    let mut sample = settings::load_from(&opts.config.settings_path())?;
    if let Some(max) = opts.max_samples {
        sample.max_samples = max;
    }
    if let Some(temperature) = opts.temperature {
        sample.temperature = temperature;
    }
    if let Some(top_k) = opts.top_k {
        sample.top_k = top_k;
    }

    let mut session = GenerationSession::new(FixtureLoader);
    let message = session.load_model(&model_path)?;
    info!("{message}");
    if opts.config.model_path.as_deref() != Some(model_path.as_path()) {
        Config::save_model_path(&model_path).context("remember model path")?;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let stopper = session.stopper();
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        stopper.stop();
    })
    .context("install Ctrl+C handler")?;

    let mut explorer = Explorer::new(sample.clone(), opts.config.layout);
    let prompt = explorer.begin(opts.prompt);
    let rx = session.start(prompt, sample)?;
    let mut ended = finish_run(&mut explorer, &mut session, rx).await?;

    for spec in opts.branches {
        if !should_branch(ended.as_ref(), &interrupted) {
            break;
        }
        let node = node_at(explorer.tree(), spec)?;
        let rx = explorer
            .restart_from(&mut session, None, node, spec.index)
            .await
            .with_context(|| format!("branch {}:{}:{}", spec.row, spec.lane, spec.index))?;
        ended = finish_run(&mut explorer, &mut session, rx).await?;
    }

    if opts.json {
        println!("{}", render_json(&explorer)?);
    } else {
        print!("{}", render_rows(explorer.tree()));
    }
    Ok(())
}

/// Further branches run only while the user has not interrupted. A Ctrl+C
/// between runs sets the flag without any worker to cancel.
fn should_branch(ended: Option<&EndReason>, interrupted: &AtomicBool) -> bool {
    ended != Some(&EndReason::Cancelled) && !interrupted.load(Ordering::SeqCst)
}

/// Drains one run and turns a failed run into an error.
async fn finish_run(
    explorer: &mut Explorer,
    session: &mut GenerationSession,
    mut rx: SessionEventRx,
) -> Result<Option<EndReason>> {
    let ended = explorer.drain(&mut rx).await;
    session.wait().await;
    if let Some(err) = explorer.take_apply_error() {
        bail!("Branch could not be recorded: {err}");
    }
    if let Some(EndReason::Failed { message }) = &ended {
        bail!("Generation failed: {message}");
    }
    if let Some(reason) = &ended {
        eprintln!("Branch ended: {reason}");
    }
    Ok(ended)
}

fn node_at(tree: &BranchTree, spec: &BranchSpec) -> Result<NodeId> {
    tree.row(spec.row)
        .find(|n| n.lane == spec.lane)
        .map(|n| n.id)
        .with_context(|| format!("No node at row {}, lane {}", spec.row, spec.lane))
}

/// One line per row: `[row] lane:"token" ...`.
fn render_rows(tree: &BranchTree) -> String {
    let mut out = String::new();
    for row in 0..tree.row_count() {
        let _ = write!(out, "[{row}]");
        for node in tree.row(row) {
            let _ = write!(out, " {}:{:?}", node.lane, node.text());
        }
        out.push('\n');
    }
    out
}

fn render_json(explorer: &Explorer) -> Result<String> {
    let nodes = explorer
        .tree()
        .nodes()
        .map(|n| NodeView {
            id: n.id,
            depth: n.depth,
            lane: n.lane,
            text: n.text(),
            prefix: &n.prefix,
            selected: n.candidates.selected_index(),
            candidates: n.candidates.len(),
        })
        .collect();
    let report = ExploreReport {
        prompt: explorer.root_prompt(),
        nodes,
        layout: explorer.layout(),
        ended: explorer.last_end(),
    };
    serde_json::to_string_pretty(&report).context("serialize explore report")
}

#[cfg(test)]
mod tests {
    use tokfork_core::candidates::{Candidate, CandidateSet};
    use tokfork_core::core::SessionEvent;

    use super::*;

    fn step(text: &str) -> SessionEvent {
        SessionEvent::StepProduced {
            candidates: Arc::new(CandidateSet::from_sample(
                1,
                vec![Candidate {
                    id: 1,
                    logit: 1.0,
                    probability: 1.0,
                }],
                text.to_string(),
            )),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_branch_spec_parses() {
        assert_eq!(
            "2:0:1".parse::<BranchSpec>().unwrap(),
            BranchSpec {
                row: 2,
                lane: 0,
                index: 1
            }
        );
        assert!("2:0".parse::<BranchSpec>().is_err());
        assert!("a:0:1".parse::<BranchSpec>().unwrap_err().contains("row"));
    }

    #[test]
    fn test_render_rows() {
        let mut explorer = Explorer::default();
        explorer.begin("The");
        explorer.apply(&step(" cat")).unwrap();
        explorer.apply(&step(" sat")).unwrap();
        assert_eq!(render_rows(explorer.tree()), "[0] 0:\" cat\" 1:\" sat\"\n");
    }

    #[test]
    fn test_should_branch_stops_after_interrupt() {
        let interrupted = AtomicBool::new(false);
        assert!(should_branch(None, &interrupted));
        assert!(should_branch(Some(&EndReason::MaxSamples), &interrupted));
        assert!(!should_branch(Some(&EndReason::Cancelled), &interrupted));

        // Ctrl+C while no worker was running
        interrupted.store(true, Ordering::SeqCst);
        assert!(!should_branch(Some(&EndReason::EndOfGeneration), &interrupted));
    }

    #[test]
    fn test_node_at_reports_missing_node() {
        let mut explorer = Explorer::default();
        explorer.begin("The");
        explorer.apply(&step(" cat")).unwrap();
        let spec = BranchSpec {
            row: 0,
            lane: 3,
            index: 0,
        };
        let err = node_at(explorer.tree(), &spec).unwrap_err();
        assert!(err.to_string().contains("row 0, lane 3"));
    }
}
