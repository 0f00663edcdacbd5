use std::{io, os::unix::io::OwnedFd};

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};

use super::FenceHandle;

/// Event source generating an event once a fence signaled
///
/// The source fires a single time and removes itself from the event loop afterwards.
/// Dropping it, or removing it from the loop, closes the fence descriptor.
#[derive(Debug)]
pub struct FenceSource {
    source: Generic<OwnedFd>,
}

impl FenceSource {
    /// Watch `fence` for readiness
    pub fn new(fence: FenceHandle) -> FenceSource {
        FenceSource {
            source: Generic::new(fence.into_fd(), Interest::READ, Mode::Level),
        }
    }
}

impl EventSource for FenceSource {
    type Event = ();
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<C>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: C,
    ) -> Result<PostAction, Self::Error>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.source
            .process_events(readiness, token, |_, _| Ok(PostAction::Remove))?;
        callback((), &mut ());
        Ok(PostAction::Remove)
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use calloop::EventLoop;

    use super::*;
    use crate::backend::renderer::sync::FdFence;

    #[test]
    fn fires_once_after_signal() {
        let mut event_loop: EventLoop<'_, ()> = EventLoop::try_new().unwrap();
        let fence = FdFence::eventfd(false).unwrap();
        let fired = Rc::new(Cell::new(0));

        let counter = fired.clone();
        event_loop
            .handle()
            .insert_source(FenceSource::new(fence.handle().unwrap()), move |_, _, _| {
                counter.set(counter.get() + 1);
            })
            .unwrap();

        event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        assert_eq!(fired.get(), 0);

        fence.signal().unwrap();
        event_loop.dispatch(Some(Duration::from_millis(10)), &mut ()).unwrap();
        assert_eq!(fired.get(), 1);

        // the fence stays readable, but the source removed itself
        event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        assert_eq!(fired.get(), 1);
    }
}
