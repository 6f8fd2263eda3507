//! Join reducers: fold branch results into one payload.
//!
//! When a join emits, the registered [`JoinReducer`] collapses the arrived
//! branch tokens into the payload of the reduced token. Parallel nodes name
//! their reducer; names resolve through the [`ReducerRegistry`].

mod map_merge;
mod registry;

pub use map_merge::MapMerge;
pub use registry::ReducerRegistry;

use serde_json::Value;

use crate::token::Token;

/// Folds the payloads of arrived branch tokens into one value.
///
/// `tokens` is ordered by arrival; in `Any`/`Each` modes it holds exactly
/// one token. Reduction is pure: reducers see immutable tokens and return a
/// fresh payload.
pub trait JoinReducer: Send + Sync {
    fn reduce(&self, tokens: &[Token]) -> Value;
}

/// Adapter turning a closure into a [`JoinReducer`].
pub struct FnReducer<F>(F);

impl<F> FnReducer<F>
where
    F: Fn(&[Token]) -> Value + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> JoinReducer for FnReducer<F>
where
    F: Fn(&[Token]) -> Value + Send + Sync,
{
    fn reduce(&self, tokens: &[Token]) -> Value {
        (self.0)(tokens)
    }
}
