//! Plan construction: ordering, filtering, and async batch formation.
//!
//! The scheduler resolves every item's fixtures upfront (resolution errors
//! ride along and surface as `errored` at execution time), applies
//! `--lf`/`--ff`/pattern policies, then scans linearly for contiguous
//! batch-eligible async items.

use std::sync::Arc;

use crate::cache::LastFailedCache;
use crate::config::Config;
use crate::test::discovery::TestItem;
use crate::test::fixtures::{FixtureDef, FixtureRegistry, FixtureScope};
use crate::test::resolver::{self, ResolveError};

/// One item plus its resolved fixture order (or why resolution failed).
#[derive(Debug)]
pub struct PlannedTest {
    pub item: TestItem,
    pub fixtures: Result<Vec<Arc<FixtureDef>>, ResolveError>,
}

/// A contiguous run of async items sharing one cooperative event loop.
#[derive(Debug)]
pub struct AsyncBatch {
    pub loop_key: String,
    pub tests: Vec<PlannedTest>,
}

#[derive(Debug)]
pub enum PlanStep {
    Single(PlannedTest),
    Batch(AsyncBatch),
}

impl PlanStep {
    pub fn items(&self) -> impl Iterator<Item = &TestItem> {
        let slice: Vec<&TestItem> = match self {
            Self::Single(planned) => vec![&planned.item],
            Self::Batch(batch) => batch.tests.iter().map(|t| &t.item).collect(),
        };
        slice.into_iter()
    }

    pub fn first_item(&self) -> &TestItem {
        match self {
            Self::Single(planned) => &planned.item,
            Self::Batch(batch) => &batch.tests[0].item,
        }
    }

    pub fn last_item(&self) -> &TestItem {
        match self {
            Self::Single(planned) => &planned.item,
            Self::Batch(batch) => &batch.tests[batch.tests.len() - 1].item,
        }
    }
}

#[derive(Debug, Default)]
pub struct TestPlan {
    pub steps: Vec<PlanStep>,
}

impl TestPlan {
    pub fn total_items(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                PlanStep::Single(_) => 1,
                PlanStep::Batch(batch) => batch.tests.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct Scheduler<'a> {
    config: &'a Config,
    registry: &'a FixtureRegistry,
    cache: &'a LastFailedCache,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a FixtureRegistry,
        cache: &'a LastFailedCache,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
        }
    }

    /// Build the ordered plan from discovery-ordered items.
    pub fn build(&self, items: Vec<TestItem>) -> TestPlan {
        let mut items = items;

        if let Some(pattern) = &self.config.pattern {
            items.retain(|item| item.id.contains(pattern.as_str()));
        }

        // A persisted cache with zero failures filters everything out after
        // a green run; with no record at all the plan stays unchanged.
        if self.config.last_failed && self.cache.persisted() {
            items.retain(|item| self.cache.contains(&item.id));
        } else if self.config.failed_first && !self.cache.is_empty() {
            // Stable partition keeps discovery order within each half.
            let (failed, rest): (Vec<_>, Vec<_>) = items
                .into_iter()
                .partition(|item| self.cache.contains(&item.id));
            items = failed;
            items.extend(rest);
        }

        let planned: Vec<PlannedTest> = items
            .into_iter()
            .map(|item| {
                let fixtures = if item.collect_error.is_some() {
                    Ok(Vec::new())
                } else {
                    resolver::resolve(&item, self.registry)
                };
                PlannedTest { item, fixtures }
            })
            .collect();

        TestPlan {
            steps: self.form_batches(planned),
        }
    }

    /// An async item may join a batch unless one of its fixtures is async
    /// with a scope wide enough to have been acquired outside the batch's
    /// loop.
    fn batch_eligible(&self, planned: &PlannedTest) -> bool {
        if self.config.fail_fast || !planned.item.is_async {
            return false;
        }
        if planned.item.collect_error.is_some() || planned.item.skip.is_some() {
            return false;
        }
        match &planned.fixtures {
            Ok(fixtures) => !fixtures.iter().any(|def| {
                def.is_async
                    && matches!(def.scope, FixtureScope::Session | FixtureScope::Package)
            }),
            Err(_) => false,
        }
    }

    fn form_batches(&self, planned: Vec<PlannedTest>) -> Vec<PlanStep> {
        let mut steps = Vec::with_capacity(planned.len());
        let mut pending: Vec<PlannedTest> = Vec::new();
        let mut pending_key: Option<String> = None;

        let flush = |pending: &mut Vec<PlannedTest>,
                     pending_key: &mut Option<String>,
                     steps: &mut Vec<PlanStep>| {
            let key = pending_key.take();
            match pending.len() {
                0 => {}
                // A batch of one gains nothing from the gather path.
                1 => steps.push(PlanStep::Single(pending.remove(0))),
                _ => steps.push(PlanStep::Batch(AsyncBatch {
                    loop_key: key.unwrap_or_default(),
                    tests: std::mem::take(pending),
                })),
            }
        };

        for item in planned {
            if self.batch_eligible(&item) {
                let key = item.item.loop_key();
                if pending_key.as_deref() != Some(key.as_str()) {
                    flush(&mut pending, &mut pending_key, &mut steps);
                    pending_key = Some(key);
                }
                pending.push(item);
            } else {
                flush(&mut pending, &mut pending_key, &mut steps);
                steps.push(PlanStep::Single(item));
            }
        }
        flush(&mut pending, &mut pending_key, &mut steps);
        steps
    }
}
