//! Traversal bounds.
//!
//! Walks over corrupted memory must terminate, so every walker carries a
//! node budget (and the tree walker a depth budget). The defaults are far
//! above anything a healthy kernel produces.

use std::env;

use crate::error::{KscopeError, KscopeResult};

/// Environment variable overriding [`TraversalConfig::max_list_nodes`]
pub const ENV_MAX_LIST_NODES: &str = "KSCOPE_MAX_LIST_NODES";
/// Environment variable overriding [`TraversalConfig::max_tree_nodes`]
pub const ENV_MAX_TREE_NODES: &str = "KSCOPE_MAX_TREE_NODES";
/// Environment variable overriding [`TraversalConfig::max_tree_depth`]
pub const ENV_MAX_TREE_DEPTH: &str = "KSCOPE_MAX_TREE_DEPTH";

/// Walk budgets applied by a session unless a walker overrides them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalConfig
{
    /// Nodes a list walk may visit before reporting `UnterminatedList`
    pub max_list_nodes: usize,
    /// Nodes a tree walk may visit before reporting `UnterminatedTree`
    pub max_tree_nodes: usize,
    /// Deepest a tree walk may descend
    pub max_tree_depth: usize,
}

impl Default for TraversalConfig
{
    fn default() -> Self
    {
        Self {
            max_list_nodes: 1_000_000,
            max_tree_nodes: 1_000_000,
            max_tree_depth: 128,
        }
    }
}

impl TraversalConfig
{
    /// Defaults, overridden by any `KSCOPE_MAX_*` variables that are set.
    ///
    /// ## Errors
    ///
    /// [`KscopeError::InvalidArgument`] when a variable is set but is not a
    /// positive integer.
    pub fn from_env() -> KscopeResult<Self>
    {
        let mut config = Self::default();
        if let Some(value) = read_bound(ENV_MAX_LIST_NODES)? {
            config.max_list_nodes = value;
        }
        if let Some(value) = read_bound(ENV_MAX_TREE_NODES)? {
            config.max_tree_nodes = value;
        }
        if let Some(value) = read_bound(ENV_MAX_TREE_DEPTH)? {
            config.max_tree_depth = value;
        }
        Ok(config)
    }
}

fn read_bound(name: &str) -> KscopeResult<Option<usize>>
{
    match env::var(name) {
        Ok(raw) => parse_bound(name, &raw).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(KscopeError::InvalidArgument(format!("{name} is not valid UTF-8"))),
    }
}

fn parse_bound(name: &str, raw: &str) -> KscopeResult<usize>
{
    match raw.trim().replace('_', "").parse::<usize>() {
        Ok(0) => Err(KscopeError::InvalidArgument(format!("{name} must be greater than zero"))),
        Ok(value) => Ok(value),
        Err(err) => Err(KscopeError::InvalidArgument(format!("{name}={raw:?}: {err}"))),
    }
}
