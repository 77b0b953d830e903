//! Shader objects looked up by name
//!
//! Pipelines are built once from WGSL sources registered here. Every source
//! is parsed and validated with naga when it is registered, so a broken
//! shader fails at startup with a readable diagnostic instead of inside the
//! driver.

use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("shader '{name}' failed to parse:\n{message}")]
    Parse { name: String, message: String },
    #[error("shader '{name}' failed validation: {message}")]
    Validation { name: String, message: String },
    #[error("shader '{0}' is not registered")]
    NotFound(String),
}

/// Parse and validate a WGSL source.
pub fn validate_wgsl(name: &str, source: &str) -> Result<naga::Module, ShaderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| ShaderError::Parse {
        name: name.to_string(),
        message: e.emit_to_string(source),
    })?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| ShaderError::Validation {
        name: name.to_string(),
        message: e.into_inner().to_string(),
    })?;
    Ok(module)
}

/// A validated shader source
#[derive(Debug, Clone)]
pub struct ShaderObject {
    name: String,
    source: Cow<'static, str>,
}

impl ShaderObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw bytes of the source
    pub fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    pub fn size(&self) -> usize {
        self.source.len()
    }
}

/// Name -> shader lookup used during pipeline construction
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: HashMap<String, ShaderObject>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding every shader the renderer uses.
    pub fn with_builtins() -> Result<Self, ShaderError> {
        let mut library = Self::new();
        let builtins = crate::clustering::shaders::BUILTIN_SHADERS
            .iter()
            .chain(crate::pipeline::shaders::BUILTIN_SHADERS.iter());
        for (name, source) in builtins {
            library.register(*name, *source)?;
        }
        log::debug!("shader library loaded {} built-in shaders", library.len());
        Ok(library)
    }

    /// Validate and store a shader. Replaces any shader of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: impl Into<Cow<'static, str>>,
    ) -> Result<(), ShaderError> {
        let name = name.into();
        let source = source.into();
        validate_wgsl(&name, &source)?;
        if self.shaders.contains_key(&name) {
            log::warn!("replacing shader '{}'", name);
        }
        self.shaders
            .insert(name.clone(), ShaderObject { name, source });
        Ok(())
    }

    pub fn get_shader_object(&self, name: &str) -> Option<&ShaderObject> {
        self.shaders.get(name)
    }

    /// Source of a registered shader
    pub fn source(&self, name: &str) -> Result<&str, ShaderError> {
        self.get_shader_object(name)
            .map(ShaderObject::source)
            .ok_or_else(|| ShaderError::NotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}
