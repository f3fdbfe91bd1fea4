//! Flow definition model.
//!
//! A flow is built once by a composer closure that receives a [`FlowBuilder`].
//! Every `step` call adds a node to the graph and returns a [`FlowRef`] to that
//! step's eventual response; passing the reference (or one of its fields) as
//! input to a later step creates a data edge. Steps also follow the previously
//! composed unit, so the graph is the call order plus the data dependencies.
//!
//! ```text
//!   create-cart ──► validate-sales-channel ──► ┬─► reserve-inventory ─┐
//!        │                                     └─► authorize-payment ─┴─► create-order
//!        └──────────────────── data ─────────────────────────────────────────┘
//! ```
//!
//! Nodes are stored in creation order and predecessors always precede their
//! successors, so the graph is acyclic by construction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use transaction_store::{ActionType, StepStatus, StepTable, WorkflowId};

use crate::error::{Result, WorkflowError};
use crate::registry::StepRegistry;
use crate::step::StepDefinition;

/// Index of a node within its flow.
pub type NodeId = usize;

/// Predicate deciding whether a conditional branch is taken.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Where a reference reads its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSource {
    /// The transaction input.
    Input,
    /// The response of a step node.
    Step(NodeId),
}

/// Handle to a value that becomes available while the flow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRef {
    source: RefSource,
    /// JSON pointer into the source value; empty selects the whole value.
    pointer: String,
}

impl FlowRef {
    /// References the transaction input.
    pub fn input() -> Self {
        Self {
            source: RefSource::Input,
            pointer: String::new(),
        }
    }

    fn step(node: NodeId) -> Self {
        Self {
            source: RefSource::Step(node),
            pointer: String::new(),
        }
    }

    /// Projects a field of the referenced object.
    pub fn field(&self, name: &str) -> Self {
        let escaped = name.replace('~', "~0").replace('/', "~1");
        Self {
            source: self.source.clone(),
            pointer: format!("{}/{}", self.pointer, escaped),
        }
    }

    /// Projects a JSON pointer (e.g. `/items/0/id`) below the current selection.
    pub fn pointer(&self, pointer: &str) -> Self {
        Self {
            source: self.source.clone(),
            pointer: format!("{}{}", self.pointer, pointer),
        }
    }

    pub fn source(&self) -> &RefSource {
        &self.source
    }

    fn node(&self) -> Option<NodeId> {
        match self.source {
            RefSource::Input => None,
            RefSource::Step(node) => Some(node),
        }
    }

    fn select(&self, value: &Value) -> Value {
        if self.pointer.is_empty() {
            return value.clone();
        }
        value.pointer(&self.pointer).cloned().unwrap_or(Value::Null)
    }
}

/// Input expression of a step, conditional or workflow response.
#[derive(Debug, Clone, PartialEq)]
pub enum StepInput {
    Const(Value),
    Ref(FlowRef),
    Object(Vec<(String, StepInput)>),
    Array(Vec<StepInput>),
}

impl StepInput {
    pub fn constant(value: Value) -> Self {
        StepInput::Const(value)
    }

    /// Builds an object whose fields are themselves inputs.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, StepInput)>,
        K: Into<String>,
    {
        StepInput::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array(items: impl IntoIterator<Item = StepInput>) -> Self {
        StepInput::Array(items.into_iter().collect())
    }

    /// Step nodes this input reads from.
    pub fn dependencies(&self) -> BTreeSet<NodeId> {
        let mut deps = BTreeSet::new();
        self.collect_dependencies(&mut deps);
        deps
    }

    fn collect_dependencies(&self, deps: &mut BTreeSet<NodeId>) {
        match self {
            StepInput::Const(_) => {}
            StepInput::Ref(r) => deps.extend(r.node()),
            StepInput::Object(fields) => fields.iter().for_each(|(_, v)| v.collect_dependencies(deps)),
            StepInput::Array(items) => items.iter().for_each(|v| v.collect_dependencies(deps)),
        }
    }

    /// Resolves the input; step responses come from `response_of`, missing
    /// values resolve to `null`.
    fn resolve(&self, input: &Value, response_of: &dyn Fn(NodeId) -> Option<Value>) -> Value {
        match self {
            StepInput::Const(value) => value.clone(),
            StepInput::Ref(r) => match r.source {
                RefSource::Input => r.select(input),
                RefSource::Step(node) => response_of(node)
                    .map(|response| r.select(&response))
                    .unwrap_or(Value::Null),
            },
            StepInput::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(input, response_of)))
                    .collect(),
            ),
            StepInput::Array(items) => {
                Value::Array(items.iter().map(|v| v.resolve(input, response_of)).collect())
            }
        }
    }
}

impl From<FlowRef> for StepInput {
    fn from(r: FlowRef) -> Self {
        StepInput::Ref(r)
    }
}

impl From<&FlowRef> for StepInput {
    fn from(r: &FlowRef) -> Self {
        StepInput::Ref(r.clone())
    }
}

impl From<Value> for StepInput {
    fn from(value: Value) -> Self {
        StepInput::Const(value)
    }
}

/// Invocation of a registered step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub step_id: String,
    pub input: StepInput,
    pub predecessors: Vec<NodeId>,
    /// Conditional nodes that must have taken their branch for this step to run.
    pub guards: Vec<NodeId>,
}

/// Barrier in front of concurrently dispatched sibling steps.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub predecessors: Vec<NodeId>,
    pub members: Vec<NodeId>,
    pub guards: Vec<NodeId>,
}

/// Predicate node guarding a branch of steps.
#[derive(Clone)]
pub struct ConditionalBranch {
    pub input: StepInput,
    pub predecessors: Vec<NodeId>,
    pub guards: Vec<NodeId>,
    predicate: Predicate,
}

impl std::fmt::Debug for ConditionalBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalBranch")
            .field("input", &self.input)
            .field("predecessors", &self.predecessors)
            .field("guards", &self.guards)
            .finish_non_exhaustive()
    }
}

/// The designated output of the flow.
#[derive(Debug, Clone)]
pub struct WorkflowResponse {
    pub output: StepInput,
    pub predecessors: Vec<NodeId>,
}

/// A node of the flow graph.
#[derive(Debug, Clone)]
pub enum FlowNode {
    Step(StepInvocation),
    Parallel(ParallelGroup),
    Conditional(ConditionalBranch),
    Response(WorkflowResponse),
}

impl FlowNode {
    pub fn predecessors(&self) -> &[NodeId] {
        match self {
            FlowNode::Step(n) => &n.predecessors,
            FlowNode::Parallel(n) => &n.predecessors,
            FlowNode::Conditional(n) => &n.predecessors,
            FlowNode::Response(n) => &n.predecessors,
        }
    }

    pub fn guards(&self) -> &[NodeId] {
        match self {
            FlowNode::Step(n) => &n.guards,
            FlowNode::Parallel(n) => &n.guards,
            FlowNode::Conditional(n) => &n.guards,
            FlowNode::Response(_) => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FlowNode::Step(_) => "step",
            FlowNode::Parallel(_) => "parallel",
            FlowNode::Conditional(_) => "conditional",
            FlowNode::Response(_) => "response",
        }
    }
}

struct ParallelScope {
    group: NodeId,
    members: Vec<NodeId>,
}

/// Explicit builder context passed to the flow composer.
pub struct FlowBuilder {
    workflow_id: WorkflowId,
    steps: StepRegistry,
    nodes: Vec<FlowNode>,
    step_nodes: HashMap<String, NodeId>,
    /// Nodes the next sequential unit must follow.
    tail: Vec<NodeId>,
    guards: Vec<NodeId>,
    parallel: Option<ParallelScope>,
    response: Option<NodeId>,
}

impl FlowBuilder {
    fn new(workflow_id: WorkflowId) -> Self {
        Self {
            steps: StepRegistry::new(workflow_id.clone()),
            workflow_id,
            nodes: Vec::new(),
            step_nodes: HashMap::new(),
            tail: Vec::new(),
            guards: Vec::new(),
            parallel: None,
            response: None,
        }
    }

    /// Reference to the transaction input.
    pub fn input(&self) -> FlowRef {
        FlowRef::input()
    }

    /// Registers `step` and adds an invocation of it to the graph.
    pub fn step(&mut self, step: StepDefinition, input: impl Into<StepInput>) -> Result<FlowRef> {
        let input = input.into();
        let deps = self.checked_dependencies(&input)?;

        let predecessors = match &self.parallel {
            Some(scope) => {
                if let Some(sibling) = deps.iter().find(|d| scope.members.contains(*d)) {
                    return Err(self.invalid(format!(
                        "parallel step '{}' depends on sibling node {sibling}",
                        step.id()
                    )));
                }
                merge([scope.group], deps)
            }
            None => merge(self.tail.iter().copied(), deps),
        };

        let step_id = step.id().to_string();
        self.steps.register(step)?;

        let id = self.push(FlowNode::Step(StepInvocation {
            step_id: step_id.clone(),
            input,
            predecessors,
            guards: self.guards.clone(),
        }));
        self.step_nodes.insert(step_id, id);

        match &mut self.parallel {
            Some(scope) => scope.members.push(id),
            None => self.tail = vec![id],
        }
        Ok(FlowRef::step(id))
    }

    /// Composes steps that run concurrently once the preceding unit completes.
    ///
    /// Siblings may not reference each other. The next unit follows every sibling.
    pub fn parallel<F, T>(&mut self, compose: F) -> Result<T>
    where
        F: FnOnce(&mut FlowBuilder) -> Result<T>,
    {
        if self.parallel.is_some() {
            return Err(self.invalid("parallel groups cannot be nested"));
        }

        let group = self.push(FlowNode::Parallel(ParallelGroup {
            predecessors: self.tail.clone(),
            members: Vec::new(),
            guards: self.guards.clone(),
        }));
        self.parallel = Some(ParallelScope {
            group,
            members: Vec::new(),
        });

        let composed = compose(self);
        let members = self.parallel.take().map(|s| s.members).unwrap_or_default();
        let value = composed?;

        if members.is_empty() {
            return Err(self.invalid("parallel group has no steps"));
        }
        if let FlowNode::Parallel(node) = &mut self.nodes[group] {
            node.members = members.clone();
        }
        self.tail = members;
        Ok(value)
    }

    /// Composes steps that only run when `predicate` holds for the resolved `input`.
    ///
    /// Steps of a branch that is not taken are skipped, as is anything that
    /// consumes their output.
    pub fn when<P, F, T>(&mut self, input: impl Into<StepInput>, predicate: P, compose: F) -> Result<T>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        F: FnOnce(&mut FlowBuilder) -> Result<T>,
    {
        if self.parallel.is_some() {
            return Err(self.invalid("conditional branches cannot be placed inside a parallel group"));
        }

        let input = input.into();
        let deps = self.checked_dependencies(&input)?;
        let condition = self.push(FlowNode::Conditional(ConditionalBranch {
            input,
            predecessors: merge(self.tail.iter().copied(), deps),
            guards: self.guards.clone(),
            predicate: Arc::new(predicate),
        }));

        self.guards.push(condition);
        self.tail = vec![condition];
        let composed = compose(self);
        self.guards.pop();
        let value = composed?;

        self.tail = merge([condition], self.tail.iter().copied());
        Ok(value)
    }

    /// Designates the flow's output.
    pub fn response(&mut self, output: impl Into<StepInput>) -> Result<()> {
        if self.parallel.is_some() || !self.guards.is_empty() {
            return Err(self.invalid("the response must be defined at the top level"));
        }
        if self.response.is_some() {
            return Err(self.invalid("the response is already defined"));
        }

        let output = output.into();
        let deps = self.checked_dependencies(&output)?;
        let id = self.push(FlowNode::Response(WorkflowResponse {
            output,
            predecessors: merge(self.tail.iter().copied(), deps),
        }));
        self.response = Some(id);
        Ok(())
    }

    fn push(&mut self, node: FlowNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn checked_dependencies(&self, input: &StepInput) -> Result<BTreeSet<NodeId>> {
        let deps = input.dependencies();
        for dep in &deps {
            if !matches!(self.nodes.get(*dep), Some(FlowNode::Step(_))) {
                return Err(self.invalid(format!("reference to node {dep} which is not a step of this flow")));
            }
        }
        Ok(deps)
    }

    fn invalid(&self, reason: impl Into<String>) -> WorkflowError {
        WorkflowError::invalid_flow(&self.workflow_id, reason)
    }

    fn finish(self) -> Result<FlowDefinition> {
        if self.steps.is_empty() {
            return Err(self.invalid("flow has no steps"));
        }
        Ok(FlowDefinition {
            workflow_id: self.workflow_id,
            steps: self.steps,
            nodes: self.nodes,
            step_nodes: self.step_nodes,
            response: self.response,
        })
    }
}

fn merge(a: impl IntoIterator<Item = NodeId>, b: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    a.into_iter()
        .chain(b)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// An immutable flow graph, shared by every transaction of a workflow.
#[derive(Debug)]
pub struct FlowDefinition {
    workflow_id: WorkflowId,
    steps: StepRegistry,
    nodes: Vec<FlowNode>,
    step_nodes: HashMap<String, NodeId>,
    response: Option<NodeId>,
}

impl FlowDefinition {
    /// Runs `compose` once against a fresh builder and freezes the result.
    pub fn build<F>(workflow_id: impl Into<WorkflowId>, compose: F) -> Result<Self>
    where
        F: FnOnce(&mut FlowBuilder) -> Result<()>,
    {
        let mut builder = FlowBuilder::new(workflow_id.into());
        compose(&mut builder)?;
        builder.finish()
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    /// Node id of the invocation of `step_id`.
    pub fn step_node(&self, step_id: &str) -> Option<NodeId> {
        self.step_nodes.get(step_id).copied()
    }

    pub(crate) fn invocation(&self, node: NodeId) -> Option<&StepInvocation> {
        match self.nodes.get(node) {
            Some(FlowNode::Step(invocation)) => Some(invocation),
            _ => None,
        }
    }

    fn response_of<'a>(&'a self, table: &'a StepTable) -> impl Fn(NodeId) -> Option<Value> + 'a {
        move |node| {
            let invocation = self.invocation(node)?;
            table
                .get(&invocation.step_id, ActionType::Invoke)
                .filter(|r| r.status == StepStatus::Done)
                .and_then(|r| r.response.clone())
        }
    }

    /// Resolves an input expression against the transaction input and step responses.
    pub(crate) fn resolve(&self, input: &StepInput, transaction_input: &Value, table: &StepTable) -> Value {
        input.resolve(transaction_input, &self.response_of(table))
    }

    /// Resolves the designated output; `null` if the flow has none.
    pub(crate) fn result(&self, transaction_input: &Value, table: &StepTable) -> Value {
        match self.response.map(|id| &self.nodes[id]) {
            Some(FlowNode::Response(response)) => {
                self.resolve(&response.output, transaction_input, table)
            }
            _ => Value::Null,
        }
    }

    /// Derives the state of every node from the persisted step records.
    pub(crate) fn plan(&self, transaction_input: &Value, table: &StepTable) -> FlowPlan {
        let mut plan = FlowPlan {
            states: Vec::with_capacity(self.nodes.len()),
            runnable: Vec::new(),
            newly_skipped: Vec::new(),
            pending: Vec::new(),
            saga_failure: false,
        };

        for (id, node) in self.nodes.iter().enumerate() {
            let state = self.node_state(id, node, transaction_input, table, &mut plan);
            plan.states.push(state);
        }
        plan
    }

    fn node_state(
        &self,
        id: NodeId,
        node: &FlowNode,
        transaction_input: &Value,
        table: &StepTable,
        plan: &mut FlowPlan,
    ) -> NodeState {
        let states = &plan.states;
        let gate = Gate::evaluate(node, states);

        match node {
            FlowNode::Step(invocation) => {
                let record = table.get(&invocation.step_id, ActionType::Invoke);
                match record.map(|r| r.status).unwrap_or_default() {
                    StepStatus::Done | StepStatus::Reverted => NodeState::Done,
                    StepStatus::Skipped => NodeState::Skipped,
                    StepStatus::Failed => {
                        let saga = self
                            .steps
                            .resolve(&invocation.step_id)
                            .map(|s| s.options().saga)
                            .unwrap_or(true);
                        plan.saga_failure |= saga;
                        NodeState::Failed { saga }
                    }
                    StepStatus::Pending => {
                        plan.pending.push(id);
                        NodeState::Pending
                    }
                    StepStatus::Invoking | StepStatus::WaitingForRetry => {
                        plan.runnable.push(id);
                        NodeState::InFlight
                    }
                    StepStatus::NotStarted => match gate {
                        Gate::Skip => {
                            plan.newly_skipped.push(id);
                            NodeState::Skipped
                        }
                        Gate::Wait => NodeState::Waiting,
                        Gate::Open => {
                            plan.runnable.push(id);
                            NodeState::Ready
                        }
                    },
                }
            }
            FlowNode::Parallel(_) => match gate {
                Gate::Skip => NodeState::Skipped,
                Gate::Wait => NodeState::Waiting,
                Gate::Open => NodeState::Done,
            },
            FlowNode::Conditional(branch) => match gate {
                Gate::Skip => NodeState::Skipped,
                Gate::Wait => NodeState::Waiting,
                Gate::Open => {
                    let value = self.resolve(&branch.input, transaction_input, table);
                    NodeState::Decided((branch.predicate)(&value))
                }
            },
            FlowNode::Response(_) => NodeState::Done,
        }
    }
}

/// Runtime state of a node, derived from step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Waiting,
    Ready,
    InFlight,
    Pending,
    Done,
    Skipped,
    Failed { saga: bool },
    /// A conditional node that evaluated its predicate.
    Decided(bool),
}

impl NodeState {
    /// Successors ordered after this node may start.
    fn unblocks(self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Skipped | NodeState::Decided(_) | NodeState::Failed { saga: false }
        )
    }

    /// Consumers of this node's response cannot run.
    fn withholds_data(self) -> bool {
        matches!(self, NodeState::Skipped | NodeState::Failed { .. })
    }

    pub(crate) fn is_settled(self) -> bool {
        self.unblocks()
    }
}

enum Gate {
    Open,
    Wait,
    Skip,
}

impl Gate {
    fn evaluate(node: &FlowNode, states: &[NodeState]) -> Gate {
        for guard in node.guards() {
            match states[*guard] {
                NodeState::Decided(true) => {}
                NodeState::Decided(false) | NodeState::Skipped => return Gate::Skip,
                _ => return Gate::Wait,
            }
        }
        if !node.predecessors().iter().all(|p| states[*p].unblocks()) {
            return Gate::Wait;
        }

        let data = match node {
            FlowNode::Step(n) => n.input.dependencies(),
            FlowNode::Conditional(n) => n.input.dependencies(),
            FlowNode::Parallel(_) | FlowNode::Response(_) => BTreeSet::new(),
        };
        if data.iter().any(|d| states[*d].withholds_data()) {
            return Gate::Skip;
        }
        Gate::Open
    }
}

/// Snapshot of what the engine may do next for one transaction.
#[derive(Debug)]
pub(crate) struct FlowPlan {
    pub states: Vec<NodeState>,
    /// Step nodes that may be invoked, or whose interrupted attempt must continue.
    pub runnable: Vec<NodeId>,
    /// Step nodes that must be recorded as skipped.
    pub newly_skipped: Vec<NodeId>,
    pub pending: Vec<NodeId>,
    /// A saga step failed permanently; the transaction must compensate.
    pub saga_failure: bool,
}

impl FlowPlan {
    /// True when every step node has settled.
    pub fn is_complete(&self, flow: &FlowDefinition) -> bool {
        !self.saga_failure
            && flow
                .nodes
                .iter()
                .zip(&self.states)
                .filter(|(node, _)| matches!(node, FlowNode::Step(_)))
                .all(|(_, state)| state.is_settled())
    }
}
