use {
    std::{collections::HashSet, path::{Path, PathBuf}},
    tokio::fs,
    tracing::debug,
    serde::Deserialize,
    fx_rpc::{BindingDirection, RpcBindingInfo, RpcFunctionMetadata},
    crate::error::FunctionMetadataError,
};

pub const FUNCTION_FILE_SUFFIX: &str = ".function.yaml";

/// Function as loaded from its `<name>.function.yaml` file. Immutable once loaded.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionMetadata {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default)]
    pub function_id: String,
    pub language: String,
    pub script_file: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub bindings: Vec<BindingMetadata>,

    #[serde(skip_deserializing)]
    pub directory: PathBuf,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BindingMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub binding_type: String,
    pub direction: Direction,
    pub data_type: Option<BindingDataType>,
}

#[derive(Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    InOut,
}

#[derive(Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BindingDataType {
    String,
    Binary,
    Stream,
}

impl FunctionMetadata {
    pub fn new(name: impl Into<String>, language: impl Into<String>, script_file: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            function_id: name.clone(),
            name,
            language: language.into(),
            script_file: script_file.into(),
            entry_point: String::new(),
            bindings: Vec::new(),
            directory: PathBuf::new(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding_type: impl Into<String>, direction: Direction) -> Self {
        self.bindings.push(BindingMetadata {
            name: name.into(),
            binding_type: binding_type.into(),
            direction,
            data_type: None,
        });
        self
    }

    pub fn output_bindings(&self) -> impl Iterator<Item = &BindingMetadata> {
        self.bindings.iter().filter(|v| matches!(v.direction, Direction::Out | Direction::InOut))
    }

    pub fn to_rpc(&self) -> RpcFunctionMetadata {
        RpcFunctionMetadata {
            name: self.name.clone(),
            directory: self.directory.to_string_lossy().into_owned(),
            script_file: self.script_file.clone(),
            entry_point: self.entry_point.clone(),
            language: self.language.clone(),
            bindings: self.bindings.iter()
                .map(|binding| RpcBindingInfo {
                    name: binding.name.clone(),
                    binding_type: binding.binding_type.clone(),
                    direction: match binding.direction {
                        Direction::In => BindingDirection::In,
                        Direction::Out => BindingDirection::Out,
                        Direction::InOut => BindingDirection::InOut,
                    },
                })
                .collect(),
        }
    }
}

/// Loads every `*.function.yaml` file in `dir`, sorted by function name.
pub async fn load_functions(dir: &Path) -> Result<Vec<FunctionMetadata>, FunctionMetadataError> {
    let mut entries = fs::read_dir(dir).await
        .map_err(|source| FunctionMetadataError::Read { path: dir.to_owned(), source })?;

    let mut functions = Vec::new();
    let mut names = HashSet::new();
    while let Some(entry) = entries.next_entry().await
        .map_err(|source| FunctionMetadataError::Read { path: dir.to_owned(), source })? {
        let path = entry.path();
        let is_function_file = path.file_name()
            .and_then(|v| v.to_str())
            .is_some_and(|v| v.ends_with(FUNCTION_FILE_SUFFIX));
        if !is_function_file {
            continue;
        }

        let content = fs::read(&path).await
            .map_err(|source| FunctionMetadataError::Read { path: path.clone(), source })?;
        let mut function: FunctionMetadata = serde_yml::from_slice(&content)
            .map_err(|source| FunctionMetadataError::Parse { path: path.clone(), source })?;
        if function.function_id.is_empty() {
            function.function_id = function.name.clone();
        }
        function.directory = dir.to_owned();

        if !names.insert(function.name.clone()) {
            return Err(FunctionMetadataError::Duplicate { name: function.name });
        }
        debug!(function = function.name, language = function.language, "loaded function metadata");
        functions.push(function);
    }

    functions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_function_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.function.yaml"), r#"
name: hello
language: python
script_file: hello.py
entry_point: main
bindings:
  - name: req
    type: httpTrigger
    direction: in
  - name: result
    type: http
    direction: out
    data_type: string
"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a function").unwrap();

        let functions = load_functions(dir.path()).await.unwrap();
        assert_eq!(functions.len(), 1);

        let hello = &functions[0];
        assert_eq!(hello.function_id, "hello");
        assert_eq!(hello.directory, dir.path());
        assert_eq!(hello.output_bindings().map(|v| v.name.as_str()).collect::<Vec<_>>(), vec!["result"]);
        assert_eq!(hello.bindings[1].data_type, Some(BindingDataType::String));

        let rpc = hello.to_rpc();
        assert_eq!(rpc.entry_point, "main");
        assert_eq!(rpc.bindings[0].direction, BindingDirection::In);
    }

    #[tokio::test]
    async fn duplicate_function_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["a.function.yaml", "b.function.yaml"] {
            std::fs::write(dir.path().join(file), "name: same\nlanguage: node\nscript_file: index.js\n").unwrap();
        }

        let err = load_functions(dir.path()).await.unwrap_err();
        assert!(matches!(err, FunctionMetadataError::Duplicate { name } if name == "same"));
    }
}
