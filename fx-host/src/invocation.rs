use {
    std::{collections::HashMap, time::Duration},
    tokio_util::sync::CancellationToken,
    fx_rpc::TypedData,
    crate::data_cache::FunctionDataCacheKey,
};

/// Bound argument values for one invocation of a function.
#[derive(Debug, Clone)]
pub struct ScriptInvocationContext {
    pub function_name: String,
    pub invocation_id: String,
    pub inputs: Vec<InvocationInput>,
    pub trigger_metadata: HashMap<String, TypedData>,
    /// Overrides the configured invocation timeout.
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct InvocationInput {
    pub name: String,
    pub value: TypedData,
    /// Inputs with a key may be served from the function data cache.
    pub cache_key: Option<FunctionDataCacheKey>,
}

impl ScriptInvocationContext {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            invocation_id: uuid::Uuid::new_v4().to_string(),
            inputs: Vec::new(),
            trigger_metadata: HashMap::new(),
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = invocation_id.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<TypedData>) -> Self {
        self.inputs.push(InvocationInput {
            name: name.into(),
            value: value.into(),
            cache_key: None,
        });
        self
    }

    pub fn with_cached_input(mut self, name: impl Into<String>, value: impl Into<TypedData>, cache_key: FunctionDataCacheKey) -> Self {
        self.inputs.push(InvocationInput {
            name: name.into(),
            value: value.into(),
            cache_key: Some(cache_key),
        });
        self
    }

    pub fn with_trigger_metadata(mut self, name: impl Into<String>, value: impl Into<TypedData>) -> Self {
        self.trigger_metadata.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationResult {
    pub return_value: Option<TypedData>,
    pub outputs: HashMap<String, TypedData>,
}

impl InvocationResult {
    pub fn output(&self, name: &str) -> Option<&TypedData> {
        self.outputs.get(name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let outputs: serde_json::Map<String, serde_json::Value> = self.outputs.iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::json!({
            "return_value": self.return_value.as_ref().map(TypedData::to_json),
            "outputs": outputs,
        })
    }
}
