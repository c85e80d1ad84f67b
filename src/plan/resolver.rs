//! Fixture model resolver
//!
//! Validates descriptors and resolves inheritance into per-fixture hook
//! chains. Configuration mistakes are reported here, before anything runs.

use std::collections::{HashMap, HashSet};
use tracing::info;

use super::expansion::Expander;
use super::{
    Disposition, ExecutionPlan, HookKindKey, HookStep, Invocation, PlannedCase, PlannedFixture,
};
use crate::config::EngineConfig;
use crate::error::PlanError;
use crate::executor::RetryOverride;
use crate::host::IsolationHost;
use crate::models::{
    Apartment, CaseTemplate, FixtureDescriptor, HookDescriptor, HookKind, InheritanceMode,
    RunDescriptor,
};

const RUN_OWNER: &str = "run";

/// Builds an [`ExecutionPlan`] from discovery output
pub struct PlanBuilder<'a> {
    config: &'a EngineConfig,
    host: &'a dyn IsolationHost,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(config: &'a EngineConfig, host: &'a dyn IsolationHost) -> Self {
        Self { config, host }
    }

    pub fn build(&self, run: &RunDescriptor) -> Result<ExecutionPlan, PlanError> {
        let (run_init, run_cleanup) = resolve_run_hooks(&run.run_hooks)?;
        let fixtures = index_fixtures(&run.fixtures)?;

        let mut plan = ExecutionPlan {
            run_init,
            run_cleanup,
            fixtures: Vec::new(),
        };
        let mut next_index = 0;

        for fixture in &run.fixtures {
            let lineage = lineage(fixture, &fixtures)?;
            if fixture.is_abstract {
                continue;
            }
            let planned = self.plan_fixture(fixture, &lineage, &mut next_index);
            plan.fixtures.push(planned);
        }

        info!(
            "Built execution plan: {} fixture(s), {} case(s)",
            plan.fixtures.len(),
            plan.case_count()
        );
        Ok(plan)
    }

    fn plan_fixture(
        &self,
        fixture: &FixtureDescriptor,
        lineage: &[&FixtureDescriptor],
        next_index: &mut usize,
    ) -> PlannedFixture {
        let apartment = lineage
            .iter()
            .rev()
            .find_map(|f| f.apartment)
            .unwrap_or(self.config.apartment);

        let mut init_chain = Vec::new();
        let mut cleanup_chain = Vec::new();
        for ancestor in lineage {
            let participates = |hook: &HookDescriptor| {
                ancestor.id == fixture.id
                    || (hook.inheritance == InheritanceMode::BeforeEachDerived
                        && ancestor.ignore.is_none())
            };
            if let Some(hook) = find_hook(ancestor, HookKind::FixtureInit) {
                if participates(hook) {
                    init_chain.push(step(hook, &ancestor.id, apartment));
                }
            }
            if let Some(hook) = find_hook(ancestor, HookKind::FixtureCleanup) {
                if participates(hook) {
                    cleanup_chain.push(step(hook, &ancestor.id, apartment));
                }
            }
        }
        cleanup_chain.reverse();

        let mut case_hooks = std::collections::BTreeMap::new();
        for kind in [
            HookKind::Construct,
            HookKind::CaseInit,
            HookKind::CaseCleanup,
            HookKind::Teardown,
        ] {
            let mut chain: Vec<HookStep> = lineage
                .iter()
                .filter_map(|f| find_hook(f, kind).map(|h| step(h, &f.id, apartment)))
                .collect();
            if matches!(kind, HookKind::CaseCleanup | HookKind::Teardown) {
                chain.reverse();
            }
            if let Some(key) = HookKindKey::from_kind(kind) {
                case_hooks.insert(key, chain);
            }
        }

        let mut cases = Vec::new();
        for template in inherited_templates(lineage) {
            if let Some(reason) = &fixture.ignore {
                let id = format!("{}.{}", fixture.id, template.name);
                cases.push(self.planned_case(
                    fixture,
                    template,
                    apartment,
                    next_index,
                    id,
                    template.name.clone(),
                    vec![Invocation::new(Vec::new(), template.name.clone())],
                    Default::default(),
                    Disposition::Skip(reason.clone()),
                ));
                continue;
            }
            let expander = Expander::new(self.config, self.host);
            for expanded in expander.expand(&fixture.id, &fixture.boundary, template) {
                cases.push(self.planned_case(
                    fixture,
                    template,
                    apartment,
                    next_index,
                    expanded.id,
                    expanded.display_name,
                    expanded.invocations,
                    expanded.bindings,
                    expanded.disposition,
                ));
            }
        }

        PlannedFixture {
            id: fixture.id.clone(),
            display_name: fixture.display_name().to_string(),
            boundary: fixture.boundary.clone(),
            init_chain,
            cleanup_chain,
            case_hooks,
            cleanup_timing: fixture.cleanup_timing.unwrap_or(self.config.cleanup_timing),
            parallel: fixture.parallel.unwrap_or(true),
            apartment,
            ignore: fixture.ignore.clone(),
            cases,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn planned_case(
        &self,
        fixture: &FixtureDescriptor,
        template: &CaseTemplate,
        fixture_apartment: Apartment,
        next_index: &mut usize,
        id: String,
        display_name: String,
        invocations: Vec<Invocation>,
        bindings: super::generics::Bindings,
        disposition: Disposition,
    ) -> PlannedCase {
        let index = *next_index;
        *next_index += 1;
        PlannedCase {
            index,
            id,
            display_name,
            fixture_id: fixture.id.clone(),
            body: template.body.clone(),
            invocations,
            bindings,
            disposition,
            timeout_ms: template.timeout_ms,
            cooperative: template.cooperative,
            retry: RetryOverride {
                retries: template.retry,
                delay_ms: template.retry_delay_ms,
                backoff: template.retry_backoff,
            },
            apartment: template.apartment.unwrap_or(fixture_apartment),
        }
    }
}

fn step(hook: &HookDescriptor, owner: &str, default_apartment: Apartment) -> HookStep {
    HookStep {
        kind: hook.kind,
        target: hook.target.clone(),
        owner: owner.to_string(),
        timeout_ms: hook.timeout_ms,
        cooperative: hook.cooperative,
        apartment: hook.apartment.unwrap_or(default_apartment),
    }
}

fn find_hook(fixture: &FixtureDescriptor, kind: HookKind) -> Option<&HookDescriptor> {
    fixture.hooks.iter().find(|h| h.kind == kind)
}

/// Run hooks stay off apartment threads unless they ask for one
fn resolve_run_hooks(
    hooks: &[HookDescriptor],
) -> Result<(Option<HookStep>, Option<HookStep>), PlanError> {
    let mut init = None;
    let mut cleanup = None;
    for hook in hooks {
        let slot = match hook.kind {
            HookKind::RunInit => &mut init,
            HookKind::RunCleanup => &mut cleanup,
            kind => {
                return Err(PlanError::MisplacedHook {
                    kind,
                    scope: "run",
                })
            }
        };
        if slot.is_some() {
            return Err(PlanError::DuplicateRunHook(hook.kind));
        }
        *slot = Some(step(hook, RUN_OWNER, Apartment::Any));
    }
    Ok((init, cleanup))
}

fn index_fixtures(
    fixtures: &[FixtureDescriptor],
) -> Result<HashMap<&str, &FixtureDescriptor>, PlanError> {
    let mut index = HashMap::new();
    for fixture in fixtures {
        if index.insert(fixture.id.as_str(), fixture).is_some() {
            return Err(PlanError::DuplicateFixture(fixture.id.clone()));
        }

        let mut kinds = HashSet::new();
        for hook in &fixture.hooks {
            if hook.kind.is_run_scoped() {
                return Err(PlanError::MisplacedHook {
                    kind: hook.kind,
                    scope: "fixture",
                });
            }
            if !kinds.insert(hook.kind) {
                return Err(PlanError::DuplicateHook {
                    fixture: fixture.id.clone(),
                    kind: hook.kind,
                });
            }
        }

        let mut names = HashSet::new();
        for case in &fixture.cases {
            if !names.insert(case.name.as_str()) {
                return Err(PlanError::DuplicateCase {
                    fixture: fixture.id.clone(),
                    case: case.name.clone(),
                });
            }
        }
    }
    Ok(index)
}

/// Ancestors of `fixture`, outermost base first, ending with the fixture itself
fn lineage<'a>(
    fixture: &'a FixtureDescriptor,
    index: &HashMap<&str, &'a FixtureDescriptor>,
) -> Result<Vec<&'a FixtureDescriptor>, PlanError> {
    let mut chain = vec![fixture];
    let mut seen = HashSet::from([fixture.id.as_str()]);
    let mut current = fixture;

    while let Some(base_id) = &current.base {
        let base = index
            .get(base_id.as_str())
            .copied()
            .ok_or_else(|| PlanError::UnknownBase {
                fixture: current.id.clone(),
                base: base_id.clone(),
            })?;
        if !seen.insert(base.id.as_str()) {
            return Err(PlanError::InheritanceCycle(fixture.id.clone()));
        }
        chain.push(base);
        current = base;
    }

    chain.reverse();
    Ok(chain)
}

/// Case templates visible to the last fixture in `lineage`; a derived
/// template replaces an inherited one of the same name
fn inherited_templates<'a>(lineage: &[&'a FixtureDescriptor]) -> Vec<&'a CaseTemplate> {
    let mut templates: Vec<&CaseTemplate> = Vec::new();
    for fixture in lineage.iter().copied() {
        for template in &fixture.cases {
            match templates.iter_mut().find(|t| t.name == template.name) {
                Some(existing) => *existing = template,
                None => templates.push(template),
            }
        }
    }
    templates
}
