// stage.rs — Stage nodes and the graph-clone memo map
//
// A `Stage` is a reference-counted compiler node owning a pure-definition
// schedule plus one schedule per update definition. Stages reference each
// other through schedule wrapper maps, so the stage graph may contain cycles.
//
// Preconditions: none.
// Postconditions: `Stage::deep_copy` registers the clone in the memo map
//   before cloning its schedules, so every original maps to exactly one clone
//   and cycles through wrappers terminate.
// Failure modes: propagates `ScheduleError` from schedule deep copy.
// Side effects: none.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::diag::ScheduleError;
use crate::reduction::ReductionDomain;
use crate::schedule::{Dim, Schedule};

// ── Stage ───────────────────────────────────────────────────────────────────

struct StageContents {
    name: String,
    args: Vec<String>,
    schedule: Schedule,
    updates: Vec<Schedule>,
}

/// Reference-counted handle to a stage. Cloning aliases.
#[derive(Clone)]
pub struct Stage(Rc<RefCell<StageContents>>);

impl Stage {
    /// A stage with pure arguments `args` (innermost first) and a default
    /// schedule whose loop nest visits them in that order.
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        let schedule = Schedule::new();
        schedule
            .dims_mut()
            .extend(args.iter().map(|a| Dim::pure(*a)));
        Stage(Rc::new(RefCell::new(StageContents {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            schedule,
            updates: Vec::new(),
        })))
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn args(&self) -> Vec<String> {
        self.0.borrow().args.clone()
    }

    /// The pure definition's schedule (an alias).
    pub fn schedule(&self) -> Schedule {
        self.0.borrow().schedule.clone()
    }

    /// Update-definition schedules, in definition order.
    pub fn updates(&self) -> Vec<Schedule> {
        self.0.borrow().updates.clone()
    }

    /// Add an update definition iterating over `domain` and return its
    /// schedule. Reduction variables become impure innermost dims.
    pub fn add_update(&self, domain: ReductionDomain) -> Schedule {
        let schedule = Schedule::new();
        {
            let mut dims = schedule.dims_mut();
            dims.extend(domain.domain().iter().map(|rv| Dim {
                pure: false,
                ..Dim::pure(rv.var.clone())
            }));
            dims.extend(self.args().iter().map(|a| Dim::pure(a.clone())));
        }
        schedule.set_reduction_domain(domain);
        self.0.borrow_mut().updates.push(schedule.clone());
        schedule
    }

    /// True if both handles alias the same node.
    pub fn same_as(&self, other: &Stage) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Clone this stage and everything its schedules reach, sharing `memo`
    /// with any enclosing graph clone.
    pub fn deep_copy(&self, memo: &mut DeepCopyMap) -> Result<Stage, ScheduleError> {
        if let Some(copy) = memo.get(self) {
            return Ok(copy);
        }
        let (name, args, schedule, updates) = {
            let c = self.0.borrow();
            (
                c.name.clone(),
                c.args.clone(),
                c.schedule.clone(),
                c.updates.clone(),
            )
        };
        let copy = Stage(Rc::new(RefCell::new(StageContents {
            name,
            args,
            schedule: Schedule::undefined(),
            updates: Vec::new(),
        })));
        // Register before recursing: a wrapper cycle leads back here.
        memo.insert(self, copy.clone());

        let schedule = schedule.deep_copy(memo)?;
        let updates = updates
            .iter()
            .map(|u| u.deep_copy(memo))
            .collect::<Result<Vec<_>, _>>()?;
        {
            let mut c = copy.0.borrow_mut();
            c.schedule = schedule;
            c.updates = updates;
        }
        Ok(copy)
    }
}

impl fmt::Debug for Stage {
    // Names only: the stage graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stage").field(&self.name()).finish()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0.borrow();
        writeln!(f, "stage {}({}) {{", c.name, c.args.join(", "))?;
        write_indented(f, &c.schedule.to_string())?;
        for (i, update) in c.updates.iter().enumerate() {
            writeln!(f, "    update {i} {{")?;
            write_indented(f, &indent(&update.to_string()))?;
            writeln!(f, "    }}")?;
        }
        writeln!(f, "}}")
    }
}

fn indent(text: &str) -> String {
    text.lines().map(|l| format!("    {l}\n")).collect()
}

fn write_indented(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str(&indent(text))
}

// ── Memo map ────────────────────────────────────────────────────────────────

/// Original → clone map shared by one whole-graph clone operation.
///
/// Keys are node identities. Each entry keeps the original alive next to its
/// clone so an identity cannot be reused while the map exists.
#[derive(Default)]
pub struct DeepCopyMap {
    stages: HashMap<usize, (Stage, Stage)>,
    domains: HashMap<usize, (ReductionDomain, ReductionDomain)>,
}

impl DeepCopyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The clone already made for `original`, if any.
    pub fn get(&self, original: &Stage) -> Option<Stage> {
        self.stages
            .get(&original.key())
            .map(|(_, copy)| copy.clone())
    }

    pub fn insert(&mut self, original: &Stage, copy: Stage) {
        self.stages
            .insert(original.key(), (original.clone(), copy));
    }

    /// Number of stages cloned so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Deep copy of `domain`, made once per original domain.
    pub fn copy_domain(&mut self, domain: &ReductionDomain) -> ReductionDomain {
        let key = match domain.key() {
            Some(key) => key,
            None => return ReductionDomain::default(),
        };
        self.domains
            .entry(key)
            .or_insert_with(|| (domain.clone(), domain.deep_copy()))
            .1
            .clone()
    }
}

impl fmt::Debug for DeepCopyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepCopyMap")
            .field("stages", &self.stages.len())
            .field("domains", &self.domains.len())
            .finish()
    }
}
