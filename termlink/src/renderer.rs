use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// User-supplied string transform, applied to a command string after
/// substitution or to raw sensor data before conversion.
#[derive(Clone)]
pub struct Renderer(Arc<dyn Fn(&str) -> Result<String> + Send + Sync>);

impl Renderer {
    pub fn new(render: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(render))
    }

    pub fn render(&self, string: &str) -> Result<String> {
        (self.0)(string)
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Renderer")
    }
}
