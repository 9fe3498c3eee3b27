//! Single-cell models.
//!
//! The engine only sees a [`CellModel`]: a compiled per-cell right-hand side
//! plus the metadata needed to allocate state and resolve logged variables.
//! [`ExpressionModel`] is the bundled implementation, with right-hand sides
//! written as arithmetic expressions over qualified `component.variable` names.

use log::debug;
use meval::{Context, ContextProvider, Expr};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

const SLOT_PREFIX: &str = "slot";
const UNRESOLVED_SLOT: &str = "slot_unresolved";
const BUILTIN_CONSTANTS: [&str; 2] = ["pi", "e"];

/// Per-cell values bound into the model by the engine at each evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CellInputs {
    pub time: f64,
    pub pace: f64,
    pub diffusion: f64,
}

/// Where a named variable lives once the model is compiled. Ordered as the
/// model declares its variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariableRef {
    Time,
    Pace,
    Diffusion,
    State(usize),
    Intermediate(usize),
}

/// A compiled single-cell model.
///
/// `evaluate` must be a pure function of its arguments: the engine calls it
/// concurrently for different cells and relies on identical inputs producing
/// identical outputs.
pub trait CellModel: Send + Sync {
    /// All right-hand sides are assigned and resolvable.
    fn is_valid(&self) -> bool;

    /// Evaluation order would require a cycle across components.
    fn has_interdependent_components(&self) -> bool;

    /// Qualified name of the bound time variable.
    fn time_variable(&self) -> &str;

    fn state_names(&self) -> &[String];

    fn intermediate_names(&self) -> &[String];

    fn default_state(&self) -> Vec<f64>;

    fn state_count(&self) -> usize {
        self.state_names().len()
    }

    fn intermediate_count(&self) -> usize {
        self.intermediate_names().len()
    }

    /// Index of the state that receives the diffusion current.
    fn coupling_state(&self) -> usize;

    fn variable(&self, name: &str) -> Option<VariableRef>;

    /// Writes `d(state)/dt` into `derivatives` and the intermediate values into
    /// `intermediates`. The diffusion current in `inputs` is informational:
    /// the engine adds it to the coupling state's derivative itself.
    fn evaluate(
        &self,
        inputs: &CellInputs,
        state: &[f64],
        derivatives: &mut [f64],
        intermediates: &mut [f64],
    );
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("malformed variable name '{0}' (expected component.variable)")]
    MalformedName(String),
    #[error("duplicate variable name '{0}'")]
    DuplicateName(String),
    #[error("expression for '{name}' failed to parse: {message}")]
    Parse { name: String, message: String },
    #[error("no coupling state selected")]
    MissingCoupling,
    #[error("coupling variable '{0}' is not a state variable")]
    CouplingNotState(String),
}

#[derive(Clone, Debug)]
struct Equation {
    rhs: Option<Expr>,
    refs: Vec<usize>,
    unresolved: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ExpressionModelBuilder {
    time: String,
    pace: Option<String>,
    diffusion: Option<String>,
    states: Vec<(String, f64, Option<String>)>,
    intermediates: Vec<(String, Option<String>)>,
    coupling: Option<String>,
}

impl ExpressionModelBuilder {
    pub fn pace(mut self, name: &str) -> Self {
        self.pace = Some(name.to_string());
        self
    }

    pub fn diffusion(mut self, name: &str) -> Self {
        self.diffusion = Some(name.to_string());
        self
    }

    pub fn state(mut self, name: &str, initial: f64, rhs: Option<&str>) -> Self {
        self.states
            .push((name.to_string(), initial, rhs.map(str::to_string)));
        self
    }

    pub fn variable(mut self, name: &str, rhs: Option<&str>) -> Self {
        self.intermediates
            .push((name.to_string(), rhs.map(str::to_string)));
        self
    }

    pub fn coupling_state(mut self, name: &str) -> Self {
        self.coupling = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<ExpressionModel, ModelError> {
        let mut slots: Vec<(String, VariableRef)> = Vec::new();
        slots.push((self.time.clone(), VariableRef::Time));
        if let Some(name) = &self.pace {
            slots.push((name.clone(), VariableRef::Pace));
        }
        if let Some(name) = &self.diffusion {
            slots.push((name.clone(), VariableRef::Diffusion));
        }
        for (idx, (name, _, _)) in self.states.iter().enumerate() {
            slots.push((name.clone(), VariableRef::State(idx)));
        }
        for (idx, (name, _)) in self.intermediates.iter().enumerate() {
            slots.push((name.clone(), VariableRef::Intermediate(idx)));
        }

        let mut index = HashMap::with_capacity(slots.len());
        for (slot, (name, _)) in slots.iter().enumerate() {
            if split_qualified(name).is_none() {
                return Err(ModelError::MalformedName(name.clone()));
            }
            if index.insert(name.clone(), slot).is_some() {
                return Err(ModelError::DuplicateName(name.clone()));
            }
        }

        let coupling_name = self.coupling.ok_or(ModelError::MissingCoupling)?;
        let coupling = match index.get(&coupling_name).map(|&slot| slots[slot].1) {
            Some(VariableRef::State(idx)) => idx,
            _ => return Err(ModelError::CouplingNotState(coupling_name)),
        };

        let mut states = Vec::with_capacity(self.states.len());
        let mut defaults = Vec::with_capacity(self.states.len());
        for (name, initial, rhs) in &self.states {
            states.push(compile(name, rhs.as_deref(), &index)?);
            defaults.push(*initial);
        }
        let mut intermediates = Vec::with_capacity(self.intermediates.len());
        for (name, rhs) in &self.intermediates {
            intermediates.push(compile(name, rhs.as_deref(), &index)?);
        }

        let mut problems = Vec::new();
        let names = self
            .states
            .iter()
            .map(|(name, _, _)| name)
            .chain(self.intermediates.iter().map(|(name, _)| name));
        for (name, equation) in names.zip(states.iter().chain(intermediates.iter())) {
            if equation.rhs.is_none() {
                problems.push(format!("'{name}' has no right-hand side"));
            }
            for unknown in &equation.unresolved {
                problems.push(format!("'{name}' references unknown variable '{unknown}'"));
            }
        }
        let order = match evaluation_order(&intermediates, &slots) {
            Some(order) => order,
            None => {
                problems.push("intermediate variables contain a cyclical reference".into());
                (0..intermediates.len()).collect()
            }
        };
        let interdependent = has_component_cycle(&intermediates, &slots);
        if !problems.is_empty() {
            debug!("expression model is invalid: {}", problems.join("; "));
        }

        Ok(ExpressionModel {
            time: self.time,
            state_names: self.states.into_iter().map(|(name, _, _)| name).collect(),
            intermediate_names: self
                .intermediates
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            defaults,
            states,
            intermediates,
            order,
            slots,
            index,
            coupling,
            problems,
            interdependent,
        })
    }
}

/// A [`CellModel`] whose right-hand sides are `meval` expressions.
///
/// ```
/// use cellnet::{CellModel, ExpressionModel};
///
/// let model = ExpressionModel::builder("engine.time")
///     .state("cell.x", 1.0, Some("-cell.x"))
///     .coupling_state("cell.x")
///     .build()
///     .unwrap();
/// assert!(model.is_valid());
/// ```
#[derive(Clone, Debug)]
pub struct ExpressionModel {
    time: String,
    state_names: Vec<String>,
    intermediate_names: Vec<String>,
    defaults: Vec<f64>,
    states: Vec<Equation>,
    intermediates: Vec<Equation>,
    order: Vec<usize>,
    slots: Vec<(String, VariableRef)>,
    index: HashMap<String, usize>,
    coupling: usize,
    problems: Vec<String>,
    interdependent: bool,
}

impl ExpressionModel {
    pub fn builder(time: &str) -> ExpressionModelBuilder {
        ExpressionModelBuilder {
            time: time.to_string(),
            ..ExpressionModelBuilder::default()
        }
    }

    /// Reasons the model is not valid; empty for a valid model.
    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    fn eval(
        &self,
        equation: &Equation,
        inputs: &CellInputs,
        state: &[f64],
        intermediates: &[f64],
    ) -> f64 {
        let Some(expr) = &equation.rhs else {
            return f64::NAN;
        };
        let ctx = (
            CellContext {
                slots: &self.slots,
                inputs,
                state,
                intermediates,
            },
            Context::new(),
        );
        expr.eval_with_context(ctx).unwrap_or(f64::NAN)
    }
}

impl CellModel for ExpressionModel {
    fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }

    fn has_interdependent_components(&self) -> bool {
        self.interdependent
    }

    fn time_variable(&self) -> &str {
        &self.time
    }

    fn state_names(&self) -> &[String] {
        &self.state_names
    }

    fn intermediate_names(&self) -> &[String] {
        &self.intermediate_names
    }

    fn default_state(&self) -> Vec<f64> {
        self.defaults.clone()
    }

    fn coupling_state(&self) -> usize {
        self.coupling
    }

    fn variable(&self, name: &str) -> Option<VariableRef> {
        self.index.get(name).map(|&slot| self.slots[slot].1)
    }

    fn evaluate(
        &self,
        inputs: &CellInputs,
        state: &[f64],
        derivatives: &mut [f64],
        intermediates: &mut [f64],
    ) {
        for &idx in &self.order {
            let value = self.eval(&self.intermediates[idx], inputs, state, intermediates);
            intermediates[idx] = value;
        }
        for (dst, equation) in derivatives.iter_mut().zip(self.states.iter()) {
            *dst = self.eval(equation, inputs, state, intermediates);
        }
    }
}

struct CellContext<'a> {
    slots: &'a [(String, VariableRef)],
    inputs: &'a CellInputs,
    state: &'a [f64],
    intermediates: &'a [f64],
}

impl<'a> ContextProvider for CellContext<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        let slot = name.strip_prefix(SLOT_PREFIX)?.parse::<usize>().ok()?;
        let value = match self.slots.get(slot)?.1 {
            VariableRef::Time => self.inputs.time,
            VariableRef::Pace => self.inputs.pace,
            VariableRef::Diffusion => self.inputs.diffusion,
            VariableRef::State(idx) => self.state[idx],
            VariableRef::Intermediate(idx) => self.intermediates[idx],
        };
        Some(value)
    }
}

fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (component, variable) = name.split_once('.')?;
    (is_identifier(component) && is_identifier(variable)).then_some((component, variable))
}

fn is_identifier(text: &str) -> bool {
    let mut bytes = text.bytes();
    bytes.next().is_some_and(is_ident_start) && bytes.all(is_ident_char)
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

fn compile(
    name: &str,
    rhs: Option<&str>,
    index: &HashMap<String, usize>,
) -> Result<Equation, ModelError> {
    let Some(source) = rhs else {
        return Ok(Equation {
            rhs: None,
            refs: Vec::new(),
            unresolved: Vec::new(),
        });
    };
    let (rewritten, refs, unresolved) = rewrite_references(source, index);
    let expr = Expr::from_str(&rewritten).map_err(|err| ModelError::Parse {
        name: name.to_string(),
        message: err.to_string(),
    })?;
    Ok(Equation {
        rhs: Some(expr),
        refs,
        unresolved,
    })
}

/// Replaces qualified names with slot identifiers `meval` can parse.
///
/// Bare identifiers are left alone when they are function calls or builtin
/// constants; anything else that is not a declared variable is unresolved.
fn rewrite_references(
    source: &str,
    index: &HashMap<String, usize>,
) -> (String, Vec<usize>, Vec<String>) {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 8);
    let mut refs = Vec::new();
    let mut unresolved = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        let ch = bytes[idx];
        let starts_number = ch.is_ascii_digit()
            || (ch == b'.' && bytes.get(idx + 1).is_some_and(u8::is_ascii_digit));
        if starts_number {
            let end = scan_number(bytes, idx);
            out.push_str(&source[idx..end]);
            idx = end;
            continue;
        }
        if is_ident_start(ch) {
            let mut end = scan_identifier(bytes, idx);
            if bytes.get(end) == Some(&b'.') && bytes.get(end + 1).copied().is_some_and(is_ident_start)
            {
                end = scan_identifier(bytes, end + 1);
            }
            let name = &source[idx..end];
            let is_call = bytes[end..]
                .iter()
                .find(|c| !c.is_ascii_whitespace())
                .is_some_and(|&c| c == b'(');
            let is_builtin = !name.contains('.') && (is_call || BUILTIN_CONSTANTS.contains(&name));
            if is_builtin {
                out.push_str(name);
            } else if let Some(&slot) = index.get(name) {
                out.push_str(&format!("{SLOT_PREFIX}{slot}"));
                if !refs.contains(&slot) {
                    refs.push(slot);
                }
            } else {
                out.push_str(UNRESOLVED_SLOT);
                if !unresolved.iter().any(|known| known == name) {
                    unresolved.push(name.to_string());
                }
            }
            idx = end;
            continue;
        }
        let Some(c) = source[idx..].chars().next() else {
            break;
        };
        out.push(c);
        idx += c.len_utf8();
    }
    (out, refs, unresolved)
}

fn scan_identifier(bytes: &[u8], start: usize) -> usize {
    let mut end = start + 1;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    end
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exponent = end + 1;
        if exponent < bytes.len() && (bytes[exponent] == b'+' || bytes[exponent] == b'-') {
            exponent += 1;
        }
        if exponent < bytes.len() && bytes[exponent].is_ascii_digit() {
            end = exponent;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    end
}

/// Kahn ordering of the intermediates; `None` on a reference cycle.
fn evaluation_order(
    intermediates: &[Equation],
    slots: &[(String, VariableRef)],
) -> Option<Vec<usize>> {
    let n = intermediates.len();
    let mut indegree = vec![0usize; n];
    let mut dependents = vec![Vec::new(); n];
    for (idx, equation) in intermediates.iter().enumerate() {
        for &slot in &equation.refs {
            if let VariableRef::Intermediate(dep) = slots[slot].1 {
                indegree[idx] += 1;
                dependents[dep].push(idx);
            }
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&idx| indegree[idx] == 0).collect();
    let mut head = 0;
    while let Some(&idx) = queue.get(head) {
        head += 1;
        for &dependent in &dependents[idx] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }
    (queue.len() == n).then_some(queue)
}

fn has_component_cycle(intermediates: &[Equation], slots: &[(String, VariableRef)]) -> bool {
    let component_of = move |slot: usize| split_qualified(&slots[slot].0).map_or("", |(c, _)| c);
    let intermediate_slots: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, (_, var))| matches!(var, VariableRef::Intermediate(_)))
        .map(|(slot, _)| slot)
        .collect();

    let mut components: HashMap<&str, usize> = HashMap::new();
    for &slot in &intermediate_slots {
        let next = components.len();
        components.entry(component_of(slot)).or_insert(next);
    }
    let mut edges = vec![Vec::new(); components.len()];
    for (equation, &slot) in intermediates.iter().zip(intermediate_slots.iter()) {
        let from = components[component_of(slot)];
        for &dep in &equation.refs {
            if !matches!(slots[dep].1, VariableRef::Intermediate(_)) {
                continue;
            }
            let to = components[component_of(dep)];
            if to != from && !edges[from].contains(&to) {
                edges[from].push(to);
            }
        }
    }

    // 0 = unvisited, 1 = on the current path, 2 = done
    let mut marks = vec![0u8; edges.len()];
    for root in 0..edges.len() {
        if marks[root] != 0 {
            continue;
        }
        let mut stack = vec![(root, 0usize)];
        marks[root] = 1;
        while let Some((node, next)) = stack.pop() {
            if let Some(&child) = edges[node].get(next) {
                stack.push((node, next + 1));
                match marks[child] {
                    0 => {
                        marks[child] = 1;
                        stack.push((child, 0));
                    }
                    1 => return true,
                    _ => {}
                }
            } else {
                marks[node] = 2;
            }
        }
    }
    false
}
