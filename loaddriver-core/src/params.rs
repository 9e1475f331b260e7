//! Sources of operation parameters.
//!
//! Every client of a task pulls its request parameters from its own [`ParamSource`], created by a
//! [`ParamSourceFactory`] right before the task starts. A source may be infinite or signal
//! exhaustion by returning `Ok(None)`, which ends the client's schedule normally. Errors indicate
//! malformed workload data and abort the run.

use std::fmt;

use loaddriver_types::{LeafTask, Params};

use crate::error::ParamError;

/// Yields the request parameters for consecutive operations of one client.
pub trait ParamSource: Send + 'static {
    /// Returns the parameters of the next operation, or `None` if the source is exhausted.
    fn next_params(&mut self) -> Result<Option<Params>, ParamError>;
}

impl<F> ParamSource for F
where
    F: FnMut() -> Result<Option<Params>, ParamError> + Send + 'static,
{
    fn next_params(&mut self) -> Result<Option<Params>, ParamError> {
        self()
    }
}

impl ParamSource for std::vec::IntoIter<Params> {
    fn next_params(&mut self) -> Result<Option<Params>, ParamError> {
        Ok(self.next())
    }
}

/// Creates parameter sources for the clients of a task.
pub trait ParamSourceFactory: fmt::Debug + Send + Sync + 'static {
    /// Creates the source for `client` of `task`.
    fn create(&self, task: &LeafTask, client: usize) -> Result<Box<dyn ParamSource>, ParamError>;
}

/// Repeats the static [`LeafTask::params`] forever.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticParams;

impl ParamSourceFactory for StaticParams {
    fn create(&self, task: &LeafTask, _client: usize) -> Result<Box<dyn ParamSource>, ParamError> {
        Ok(Box::new(Repeat(task.params.clone())))
    }
}

struct Repeat(Params);

impl ParamSource for Repeat {
    fn next_params(&mut self) -> Result<Option<Params>, ParamError> {
        Ok(Some(self.0.clone()))
    }
}

/// A [`ParamSourceFactory`] backed by a closure.
pub struct SourceFn<F>(pub F);

impl<F> fmt::Debug for SourceFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceFn").finish_non_exhaustive()
    }
}

impl<F> ParamSourceFactory for SourceFn<F>
where
    F: Fn(&LeafTask, usize) -> Result<Box<dyn ParamSource>, ParamError> + Send + Sync + 'static,
{
    fn create(&self, task: &LeafTask, client: usize) -> Result<Box<dyn ParamSource>, ParamError> {
        (self.0)(task, client)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn static_params_repeat() {
        let task = LeafTask::new("search", "query").with_params(json!({"q": "rust"}));
        let mut source = StaticParams.create(&task, 0).unwrap();
        for _ in 0..3 {
            assert_eq!(source.next_params().unwrap(), Some(json!({"q": "rust"})));
        }
    }

    #[test]
    fn closure_factory_per_client() {
        let factory = SourceFn(|_: &LeafTask, client: usize| {
            let source: Box<dyn ParamSource> = Box::new(vec![json!(client)].into_iter());
            Ok::<_, ParamError>(source)
        });

        let task = LeafTask::new("search", "query");
        let mut source = factory.create(&task, 3).unwrap();
        assert_eq!(source.next_params().unwrap(), Some(json!(3)));
        assert_eq!(source.next_params().unwrap(), None);
    }
}
