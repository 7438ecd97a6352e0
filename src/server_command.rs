///! Forwarder control command
///!

/// Administrative requests processed by [`Forwarder::serve`](crate::Forwarder::serve).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderCommand {
    /// resume accepting connections
    Plug,
    /// stop accepting and sever every active link
    Unplug,
    /// unplug, wait for the links to drain and return from `serve`
    Terminate,
}
