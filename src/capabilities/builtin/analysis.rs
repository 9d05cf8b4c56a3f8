//! Analysis: recursive sub-analyses of message selections.
//!
//! Both capabilities are in [`CapabilityGroup::Analysis`], so the
//! interpreter opens a recursion level for them before their arguments
//! are evaluated.

use super::Builtin;
use crate::analysis::{orchestrator, DEFAULT_PROMPT};
use crate::capabilities::{Args, CallContext, CapabilityGroup, Param};
use crate::sandbox::error::SandboxResult;
use crate::sandbox::value::Value;

const SUBSECTION_PARAMS: &[Param] = &[Param::required("messages"), Param::optional("prompt")];
const PARALLEL_PARAMS: &[Param] = &[Param::required("ranges")];

pub fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "analyze_subsection",
            group: CapabilityGroup::Analysis,
            description: "Analyze messages (ids, message dicts, or an earlier analysis) one level deeper",
            params: SUBSECTION_PARAMS,
            handler: analyze_subsection,
        },
        Builtin {
            name: "parallel_analyze",
            group: CapabilityGroup::Analysis,
            description: "Analyze each [start, end] range independently",
            params: PARALLEL_PARAMS,
            handler: parallel_analyze,
        },
    ]
}

fn analyze_subsection(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let prompt = args.opt_str(1)?.unwrap_or(DEFAULT_PROMPT);
    let result = orchestrator::analyze_subsection(cx, args.value(0)?, prompt)?;
    Ok(result.to_value())
}

fn parallel_analyze(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    orchestrator::parallel_analyze(cx, args.list(0)?)
}
