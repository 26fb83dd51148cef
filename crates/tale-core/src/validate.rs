//! `Validator<T>`: turns an untyped structured reply into `T` or a `SchemaValidation` error.
//!
//! Injected per call so structured-generation correctness is testable without a provider.

use crate::error::{TaleError, TaleResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

pub trait Validator<T>: Send + Sync {
    /// JSON schema handed to the provider.
    fn schema(&self) -> Value;

    fn validate(&self, value: Value) -> TaleResult<T>;
}

type Check<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Validator built from serde shape plus optional semantic checks.
pub struct SerdeValidator<T> {
    schema: Value,
    checks: Vec<Check<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SerdeValidator<T> {
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            checks: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Add a check run after deserialization succeeds.
    pub fn with_check(
        mut self,
        check: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.checks.push(Box::new(check));
        self
    }
}

impl<T: DeserializeOwned> Validator<T> for SerdeValidator<T> {
    fn schema(&self) -> Value {
        self.schema.clone()
    }

    fn validate(&self, value: Value) -> TaleResult<T> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| TaleError::SchemaValidation(e.to_string()))?;
        for check in &self.checks {
            check(&typed).map_err(TaleError::SchemaValidation)?;
        }
        Ok(typed)
    }
}
