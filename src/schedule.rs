//! Frame scheduling across display and XR callbacks.
//!
//! The host asks for one step callback at a time. While an XR session is
//! presenting, the display refresh callback stops firing for the scene and
//! the session's own frame callback takes over; the outstanding request
//! follows the switch so exactly one source owns it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Regular display refresh.
    Display,
    /// Frame callback of a presenting XR session.
    Xr,
}

#[derive(Debug, Default)]
pub struct FrameScheduler {
    presenting: bool,
    pending: Option<FrameSource>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source currently driving the loop.
    pub fn source(&self) -> FrameSource {
        if self.presenting {
            FrameSource::Xr
        } else {
            FrameSource::Display
        }
    }

    /// Source holding the outstanding request, if any.
    pub fn pending(&self) -> Option<FrameSource> {
        self.pending
    }

    pub fn is_presenting(&self) -> bool {
        self.presenting
    }

    /// Arm one callback on the current source. Returns `false` if a
    /// request was already outstanding.
    pub fn request(&mut self) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(self.source());
        true
    }

    /// A callback from `source` fired. Returns `true` (and disarms) if it
    /// owns the outstanding request.
    pub fn on_frame(&mut self, source: FrameSource) -> bool {
        if self.pending == Some(source) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// XR presentation started or ended. The outstanding request, if any,
    /// moves to the new source.
    pub fn set_presenting(&mut self, presenting: bool) {
        if self.presenting == presenting {
            return;
        }
        self.presenting = presenting;
        if self.pending.is_some() {
            self.pending = Some(self.source());
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_not_doubled() {
        let mut s = FrameScheduler::new();
        assert!(s.request());
        assert!(!s.request());
        assert!(s.on_frame(FrameSource::Display));
        assert!(!s.on_frame(FrameSource::Display));
    }

    #[test]
    fn pending_request_follows_presentation_edge() {
        let mut s = FrameScheduler::new();
        s.request();
        s.set_presenting(true);
        assert_eq!(s.pending(), Some(FrameSource::Xr));
        assert!(!s.on_frame(FrameSource::Display));
        assert!(s.on_frame(FrameSource::Xr));

        s.request();
        s.set_presenting(false);
        assert!(!s.on_frame(FrameSource::Xr));
        assert!(s.on_frame(FrameSource::Display));
    }

    #[test]
    fn edge_without_request_arms_nothing() {
        let mut s = FrameScheduler::new();
        s.set_presenting(true);
        assert_eq!(s.source(), FrameSource::Xr);
        assert_eq!(s.pending(), None);
    }
}
