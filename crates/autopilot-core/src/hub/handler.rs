use crate::domain::{Event, HandlerError};

/// EventHandler は hub のイベントを受け取る
///
/// エラーは hub がログに残す。publisher には届かない。
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// クロージャによるハンドラ（[`handler_fn`] を参照）
pub struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

/// クロージャを `EventHandler` に包む
///
/// ```ignore
/// hub.subscribe("task.executed", handler_fn(|event| {
///     println!("{}", event.payload);
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler(f)
}
