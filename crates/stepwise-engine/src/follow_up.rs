use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::{debug, info};

use stepwise_core::data::AccumulatedData;
use stepwise_core::reference::whole_template;
use stepwise_core::schema::ToolSchema;
use stepwise_core::types::{CompletenessReport, NextAction, Origin, SubtaskSpec};
use stepwise_tools::SchemaRegistry;

use crate::resolver::{Provenance, ResolvedParameters};

/// A root subtask and the follow-ups issued to close its shortfall.
#[derive(Debug, Clone)]
pub struct Chain {
    pub root: String,
    pub tool: String,
    /// Records the root asked for.
    pub requested: Option<usize>,
    /// Records found across the whole chain.
    pub found: usize,
    pub follow_ups: usize,
    pub last_report: Option<CompletenessReport>,
    alternates_used: Vec<String>,
}

impl Chain {
    pub fn is_complete(&self) -> bool {
        let Some(report) = &self.last_report else {
            return false;
        };
        match self.requested {
            Some(n) if n > 0 => {
                self.found >= n && report.missing_fields.is_empty() && !report.short_text
            }
            _ => report.complete,
        }
    }

    /// Records still owed, when a count was requested.
    pub fn remaining(&self) -> Option<usize> {
        self.requested.map(|n| n.saturating_sub(self.found))
    }

    pub fn coverage(&self) -> f64 {
        match self.requested {
            Some(n) if n > 0 => (self.found as f64 / n as f64).min(1.0),
            _ => self.last_report.as_ref().map(|r| r.coverage).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    AdvanceSource,
    BumpOffset,
    SwitchTool,
    Repeat,
}

/// Turns completeness shortfalls into follow-up subtasks.
///
/// Follow-ups are bounded per tool; once a tool's budget is spent its
/// shortfalls are accepted as partial.
#[derive(Debug)]
pub struct FollowUpPlanner {
    max_follow_ups: usize,
    per_tool: HashMap<String, usize>,
    chains: BTreeMap<String, Chain>,
}

impl FollowUpPlanner {
    pub fn new(max_follow_ups: usize) -> Self {
        Self {
            max_follow_ups,
            per_tool: HashMap::new(),
            chains: BTreeMap::new(),
        }
    }

    /// The chain a subtask belongs to.
    pub fn root_of(subtask: &SubtaskSpec) -> &str {
        match &subtask.origin {
            Origin::FollowUp { root, .. } => root,
            _ => &subtask.id,
        }
    }

    /// Record a committed result against its chain.
    pub fn observe(&mut self, subtask: &SubtaskSpec, report: &CompletenessReport) -> &Chain {
        let root = Self::root_of(subtask).to_string();
        let chain = self.chains.entry(root.clone()).or_insert_with(|| Chain {
            root,
            tool: subtask.tool.clone(),
            requested: report.requested_count,
            found: 0,
            follow_ups: 0,
            last_report: None,
            alternates_used: vec![],
        });
        chain.found += report.found_count.unwrap_or(0);
        chain.last_report = Some(report.clone());
        chain
    }

    pub fn chain(&self, root: &str) -> Option<&Chain> {
        self.chains.get(root)
    }

    pub fn chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.values()
    }

    /// Follow-ups already issued for a tool.
    pub fn issued(&self, tool: &str) -> usize {
        self.per_tool.get(tool).copied().unwrap_or(0)
    }

    /// Derive the next follow-up for an incomplete result, if any strategy
    /// applies and the tool's budget allows it. Call after `observe`.
    pub fn next(
        &mut self,
        subtask: &SubtaskSpec,
        schema: &ToolSchema,
        resolved: &ResolvedParameters,
        report: &CompletenessReport,
        data: &AccumulatedData,
        schemas: &SchemaRegistry,
    ) -> Option<SubtaskSpec> {
        let action = report.suggested_next_action?;
        let root = Self::root_of(subtask).to_string();
        let chain = self.chains.get(&root)?;
        if chain.is_complete() {
            return None;
        }
        if self.issued(&subtask.tool) >= self.max_follow_ups {
            info!(
                tool = %subtask.tool,
                root = %root,
                max_follow_ups = self.max_follow_ups,
                "Follow-up ceiling reached, accepting partial result"
            );
            return None;
        }

        let strategies: &[Strategy] = match action {
            NextAction::FollowUpSameTool => &[
                Strategy::AdvanceSource,
                Strategy::BumpOffset,
                Strategy::SwitchTool,
            ],
            NextAction::SwitchTool => &[
                Strategy::SwitchTool,
                Strategy::AdvanceSource,
                Strategy::BumpOffset,
            ],
            NextAction::Retry => &[Strategy::Repeat],
            NextAction::AcceptPartial => &[],
        };

        let picked = strategies.iter().find_map(|s| {
            let next = match s {
                Strategy::AdvanceSource => advance_source(subtask, schema, resolved, data)
                    .map(|p| (subtask.tool.clone(), p)),
                Strategy::BumpOffset => bump_offset(subtask, schema, resolved, report, chain)
                    .map(|p| (subtask.tool.clone(), p)),
                Strategy::SwitchTool => switch_tool(subtask, schema, chain, schemas),
                Strategy::Repeat => Some((subtask.tool.clone(), subtask.params.clone())),
            };
            next.map(|(tool, params)| (*s, tool, params))
        });

        let Some((strategy, tool, params)) = picked else {
            debug!(tool = %subtask.tool, root = %root, "No follow-up strategy applies");
            return None;
        };

        let attempt = chain.follow_ups + 1;
        let mut requirement = subtask.requirement.clone().unwrap_or_default();
        if let Some(remaining) = chain.remaining() {
            requirement.count = Some(remaining);
        }
        let follow_up = SubtaskSpec {
            id: format!("{}-f{}", root, attempt),
            tool: tool.clone(),
            params,
            depends_on: subtask.depends_on.clone(),
            requirement: Some(requirement),
            timeout_secs: subtask.timeout_secs,
            status: Default::default(),
            origin: Origin::FollowUp {
                root: root.clone(),
                attempt,
            },
        };

        *self.per_tool.entry(subtask.tool.clone()).or_insert(0) += 1;
        if let Some(chain) = self.chains.get_mut(&root) {
            chain.follow_ups = attempt;
            if matches!(strategy, Strategy::SwitchTool) {
                chain.alternates_used.push(tool);
            }
        }
        info!(
            root = %root,
            subtask = %follow_up.id,
            tool = %follow_up.tool,
            strategy = ?strategy,
            remaining = ?follow_up.requirement.as_ref().and_then(|r| r.count),
            "Follow-up planned"
        );
        Some(follow_up)
    }
}

/// Point an indexed source at its next element, if that element exists.
fn advance_source(
    subtask: &SubtaskSpec,
    schema: &ToolSchema,
    resolved: &ResolvedParameters,
    data: &AccumulatedData,
) -> Option<Map<String, Value>> {
    if !schema.follow_up.advance_source {
        return None;
    }
    for (key, provenance) in &resolved.provenance {
        let pattern = match provenance {
            Provenance::Literal => continue,
            // Only a lone template can be swapped without losing text.
            Provenance::Template(p) => match subtask.params.get(key) {
                Some(Value::String(s)) if whole_template(s).is_some() => p,
                _ => continue,
            },
            Provenance::Schema(p) => p,
        };
        let Some(index) = pattern.last_index() else {
            continue;
        };
        let next = pattern.with_last_index(index + 1);
        if data.resolve(&next).is_none() {
            continue;
        }
        let mut params = subtask.params.clone();
        params.insert(key.clone(), Value::String(next.to_template()));
        return Some(params);
    }
    None
}

/// Advance the offset parameter past the records already found.
fn bump_offset(
    subtask: &SubtaskSpec,
    schema: &ToolSchema,
    resolved: &ResolvedParameters,
    report: &CompletenessReport,
    chain: &Chain,
) -> Option<Map<String, Value>> {
    let param = schema.follow_up.offset_param.as_ref()?;
    let current = resolved
        .values
        .get(param)
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
        .unwrap_or(0);
    let found = report.found_count.unwrap_or(0) as u64;
    let mut params = subtask.params.clone();
    params.insert(param.clone(), Value::from(current + found));
    if let (Some(count_param), Some(remaining)) = (&schema.count_param, chain.remaining()) {
        params.insert(count_param.clone(), Value::from(remaining as u64));
    }
    Some(params)
}

/// First declared alternate that has a schema and has not been tried.
fn switch_tool(
    subtask: &SubtaskSpec,
    schema: &ToolSchema,
    chain: &Chain,
    schemas: &SchemaRegistry,
) -> Option<(String, Map<String, Value>)> {
    schema
        .follow_up
        .alternates
        .iter()
        .find(|alt| schemas.contains(alt) && !chain.alternates_used.contains(alt))
        .map(|alt| (alt.clone(), subtask.params.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::schema::{FollowUpPolicy, InputSpec};
    use stepwise_core::types::Requirement;

    use crate::resolver::DataFlowResolver;

    fn urls_data() -> AccumulatedData {
        AccumulatedData::from_value(&json!({
            "search": {"urls": ["https://a", "https://b"]}
        }))
        .unwrap()
    }

    fn shortfall(requested: usize, found: usize) -> CompletenessReport {
        CompletenessReport {
            complete: found >= requested,
            coverage: found as f64 / requested as f64,
            requested_count: Some(requested),
            found_count: Some(found),
            missing_fields: vec![],
            short_text: false,
            suggested_next_action: (found < requested).then_some(NextAction::FollowUpSameTool),
        }
    }

    fn extract_schema() -> ToolSchema {
        ToolSchema::new("extract").with_input(InputSpec::required("url"))
    }

    #[test]
    fn test_advances_indexed_source_with_remaining_count() {
        let data = urls_data();
        let schema = extract_schema();
        let subtask = SubtaskSpec::new("x1", "extract")
            .with_param("url", "{{search.urls[0]}}")
            .with_requirement(Requirement::count(5));
        let resolved = DataFlowResolver::new().resolve(&subtask, &schema, &data).unwrap();
        let report = shortfall(5, 3);

        let mut planner = FollowUpPlanner::new(5);
        planner.observe(&subtask, &report);
        let follow_up = planner
            .next(&subtask, &schema, &resolved, &report, &data, &SchemaRegistry::new())
            .unwrap();

        assert_eq!(follow_up.id, "x1-f1");
        assert_eq!(follow_up.tool, "extract");
        assert_eq!(follow_up.params["url"], json!("{{search.urls[1]}}"));
        assert_eq!(follow_up.requirement.unwrap().count, Some(2));
        assert_eq!(
            follow_up.origin,
            Origin::FollowUp {
                root: "x1".into(),
                attempt: 1
            }
        );
    }

    #[test]
    fn test_chain_completes_across_follow_ups() {
        let mut planner = FollowUpPlanner::new(5);
        let root = SubtaskSpec::new("x1", "extract");
        assert!(!planner.observe(&root, &shortfall(5, 3)).is_complete());

        let follow_up = SubtaskSpec::new("x1-f1", "extract").with_origin(Origin::FollowUp {
            root: "x1".into(),
            attempt: 1,
        });
        let chain = planner.observe(&follow_up, &shortfall(2, 2));
        assert!(chain.is_complete());
        assert_eq!(chain.found, 5);
        assert_eq!(chain.coverage(), 1.0);
    }

    #[test]
    fn test_no_strategy_when_source_runs_out() {
        let data = urls_data();
        let schema = extract_schema();
        let subtask = SubtaskSpec::new("x1", "extract").with_param("url", "{{search.urls[1]}}");
        let resolved = DataFlowResolver::new().resolve(&subtask, &schema, &data).unwrap();
        let report = shortfall(5, 1);

        let mut planner = FollowUpPlanner::new(5);
        planner.observe(&subtask, &report);
        assert!(planner
            .next(&subtask, &schema, &resolved, &report, &data, &SchemaRegistry::new())
            .is_none());
    }

    #[test]
    fn test_offset_follow_ups_are_bounded_per_tool() {
        let data = AccumulatedData::new();
        let schema = ToolSchema::new("catalog")
            .with_count_param("limit")
            .with_follow_up(FollowUpPolicy {
                advance_source: false,
                offset_param: Some("offset".into()),
                alternates: vec![],
            });
        let mut planner = FollowUpPlanner::new(5);
        let mut current = SubtaskSpec::new("c1", "catalog").with_param("limit", 10);
        let mut issued = 0;
        loop {
            let resolved = DataFlowResolver::new().resolve(&current, &schema, &data).unwrap();
            let report = shortfall(10, 0);
            planner.observe(&current, &report);
            match planner.next(&current, &schema, &resolved, &report, &data, &SchemaRegistry::new()) {
                Some(next) => {
                    issued += 1;
                    assert_eq!(next.params["offset"], json!(0));
                    assert_eq!(next.params["limit"], json!(10));
                    current = next;
                }
                None => break,
            }
        }
        assert_eq!(issued, 5);
        assert_eq!(planner.issued("catalog"), 5);
        assert_eq!(planner.chain("c1").unwrap().coverage(), 0.0);
    }

    #[test]
    fn test_switch_tool_uses_each_alternate_once() {
        let data = AccumulatedData::new();
        let mut schema = ToolSchema::new("extract");
        schema.follow_up.alternates = vec!["browse".into(), "missing".into()];
        let schemas = SchemaRegistry::with_builtins();
        let subtask = SubtaskSpec::new("x1", "extract").with_param("url", "https://a");
        let resolved = DataFlowResolver::new().resolve(&subtask, &schema, &data).unwrap();
        let mut report = shortfall(1, 1);
        report.complete = false;
        report.missing_fields = vec!["rating".into()];
        report.suggested_next_action = Some(NextAction::SwitchTool);

        let mut planner = FollowUpPlanner::new(5);
        planner.observe(&subtask, &report);
        let first = planner
            .next(&subtask, &schema, &resolved, &report, &data, &schemas)
            .unwrap();
        assert_eq!(first.tool, "browse");
        assert_eq!(first.params["url"], json!("https://a"));

        assert!(planner
            .next(&subtask, &schema, &resolved, &report, &data, &schemas)
            .is_none());
    }

    #[test]
    fn test_retry_repeats_same_params() {
        let data = AccumulatedData::new();
        let schema = ToolSchema::new("browse");
        let subtask = SubtaskSpec::new("b1", "browse").with_param("url", "https://a");
        let resolved = DataFlowResolver::new().resolve(&subtask, &schema, &data).unwrap();
        let report = CompletenessReport {
            complete: false,
            coverage: 0.1,
            requested_count: None,
            found_count: None,
            missing_fields: vec![],
            short_text: true,
            suggested_next_action: Some(NextAction::Retry),
        };
        let mut planner = FollowUpPlanner::new(1);
        planner.observe(&subtask, &report);
        let retry = planner
            .next(&subtask, &schema, &resolved, &report, &data, &SchemaRegistry::new())
            .unwrap();
        assert_eq!(retry.params, subtask.params);
        assert!(retry.requirement.unwrap().count.is_none());
    }
}
