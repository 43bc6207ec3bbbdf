//! Resumable step stack.
//!
//! A battle expresses "what is left to do" as a stack of serializable step
//! values. [`ExecutionStack::execute`] pops and runs them last-in first-out.
//! A step may push more steps while it runs. When a step fails, everything
//! it pushed is discarded and the step itself goes back on top, so the next
//! `execute` runs it again from the start and nothing before it repeats.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// LIFO queue of pending steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStack<S> {
    steps: Vec<S>,
    executing: bool,
}

impl<S> Default for ExecutionStack<S> {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            executing: false,
        }
    }
}

impl<S: Clone> ExecutionStack<S> {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a step; it runs before everything already queued.
    pub fn push(&mut self, step: S) {
        self.steps.push(step);
    }

    /// Push steps so that they run in the given order.
    pub fn push_all<I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: DoubleEndedIterator,
    {
        for step in steps.into_iter().rev() {
            self.steps.push(step);
        }
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of queued steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// A drain was started and has not finished.
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        self.executing
    }

    /// Queued steps, next to run last.
    #[must_use]
    pub fn steps(&self) -> &[S] {
        &self.steps
    }

    /// Drop everything (battle cancelled).
    pub fn clear(&mut self) {
        self.steps.clear();
        self.executing = false;
    }

    /// Run steps until the stack is empty.
    ///
    /// # Errors
    ///
    /// Returns the first step error. The failed step is back on top of the
    /// stack and the stack stays marked as executing.
    pub fn execute<F>(&mut self, mut run: F) -> Result<()>
    where
        F: FnMut(S, &mut Self) -> Result<()>,
    {
        self.executing = true;
        while let Some(step) = self.steps.pop() {
            let depth = self.steps.len();
            if let Err(e) = run(step.clone(), self) {
                self.steps.truncate(depth);
                self.steps.push(step);
                return Err(e);
            }
        }
        self.executing = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BattleError;
    use crate::ids::PlayerId;

    #[test]
    fn test_lifo_with_expansion() {
        let mut stack = ExecutionStack::new();
        stack.push_all(["a", "b", "c"]);
        let mut ran = Vec::new();
        stack
            .execute(|step, stack| {
                ran.push(step);
                if step == "a" {
                    stack.push_all(["a1", "a2"]);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(ran, vec!["a", "a1", "a2", "b", "c"]);
        assert!(!stack.is_executing());
    }

    #[test]
    fn test_failed_step_resumes_without_repeats() {
        let mut stack = ExecutionStack::new();
        stack.push_all([1, 2, 3]);
        let mut ran = Vec::new();
        let mut fail_once = true;
        let result = stack.execute(|step, stack| {
            if step == 2 && fail_once {
                fail_once = false;
                stack.push(99);
                return Err(BattleError::Suspended(PlayerId(1)));
            }
            ran.push(step);
            Ok(())
        });
        assert!(result.unwrap_err().is_suspension());
        assert!(stack.is_executing());
        assert_eq!(stack.steps(), &[3, 2]);

        stack
            .execute(|step, _| {
                ran.push(step);
                Ok(())
            })
            .unwrap();
        assert_eq!(ran, vec![1, 2, 3]);
    }

    #[test]
    fn test_serializes_pending_steps() {
        let mut stack = ExecutionStack::new();
        stack.push_all([10_u32, 20]);
        let bytes = bincode::serialize(&stack).unwrap();
        let restored: ExecutionStack<u32> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, stack);
    }
}
