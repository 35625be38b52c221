//! 极简并行任务执行器
//!
//! 每个任务一个线程，没有并发上限、取消或超时；调用方只需提交任务然后等待全部完成。

use anyhow::{Context, Result, anyhow};
use std::any::Any;
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::error::PatchError;

#[derive(Default)]
pub struct ParallelTaskRunner {
    handles: Vec<JoinHandle<Result<()>>>,
    closed: bool,
}

impl ParallelTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 立即在新线程上启动任务，不阻塞调用方
    pub fn add_task<F>(&mut self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.closed {
            return Err(PatchError::RunnerClosed.into());
        }

        let index = self.handles.len();
        let handle = thread::Builder::new()
            .name(format!("task-{}", index))
            .spawn(task)
            .with_context(|| format!("无法创建任务线程 #{}", index))?;
        self.handles.push(handle);
        Ok(())
    }

    /// 等待所有任务结束，之后执行器关闭
    ///
    /// 多个任务失败时返回提交顺序最早的那个。
    pub fn join_all(&mut self) -> Result<()> {
        self.closed = true;

        let mut first_failure = None;
        for (index, handle) in self.handles.drain(..).enumerate() {
            let outcome = handle.join().unwrap_or_else(|panic| {
                Err(anyhow!("任务 panic: {}", panic_message(panic.as_ref())))
            });
            if let Err(err) = outcome {
                debug!("任务 #{} 失败: {:#}", index, err);
                first_failure.get_or_insert((index, err));
            }
        }

        match first_failure {
            Some((index, err)) => Err(PatchError::TaskFailure {
                index,
                source: err.into(),
            }
            .into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("未知错误")
}
