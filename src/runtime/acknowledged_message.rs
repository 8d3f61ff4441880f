use tokio::sync::oneshot;

/// A message type that includes a channel for the handler to acknowledge receipt or return a
/// result to the sender.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    acknowledger: Acknowledger<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Create a new message and return it along with the receiver that will be notified when the
    /// message is acknowledged.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: Acknowledger { sender },
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    pub(crate) fn into_parts(self) -> (M, Acknowledger<R>) {
        (self.message, self.acknowledger)
    }
}

#[derive(Debug)]
pub(crate) struct Acknowledger<R> {
    sender: oneshot::Sender<R>,
}

impl<R> Acknowledger<R> {
    /// Send the result to the receiver. If the receiver has stopped listening the result is
    /// dropped.
    pub(crate) fn acknowledge(self, result: R) {
        let _ = self.sender.send(result);
    }
}

/// Receiver for the result of a message's handling.
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Wait for the message to be handled. `None` means the handler went away without
    /// acknowledging.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
