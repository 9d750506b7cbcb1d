//! State-change notifications for outer connections

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::connection::ConnectionState;

/// One observable transition of an outer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
   pub connection_id: Uuid,
   pub original: ConnectionState,
   pub current: ConnectionState,
   pub timestamp: Instant,
}

/// Fan-out of state changes to any number of subscribers.
///
/// Publishing never blocks; with no subscribers the event is dropped.
#[derive(Debug)]
pub(crate) struct StateChangeBroker {
   tx: broadcast::Sender<StateChange>,
}

impl StateChangeBroker {
   pub fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity.max(1));
      Self { tx }
   }

   pub fn publish(&self, connection_id: Uuid, original: ConnectionState, current: ConnectionState) {
      if original == current {
         return;
      }
      trace!(%connection_id, ?original, ?current, "Connection state changed");
      let _ = self.tx.send(StateChange {
         connection_id,
         original,
         current,
         timestamp: Instant::now(),
      });
   }

   pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
      self.tx.subscribe()
   }
}

/// A stream of state changes, optionally limited to one connection.
///
/// Lagging consumers skip what they missed instead of ending the stream.
pub struct StateChangeStream {
   inner: BroadcastStream<StateChange>,
   connection_id: Option<Uuid>,
}

impl StateChangeStream {
   pub fn new(rx: broadcast::Receiver<StateChange>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         connection_id: None,
      }
   }

   pub fn for_connection(mut self, connection_id: Uuid) -> Self {
      self.connection_id = Some(connection_id);
      self
   }
}

impl Stream for StateChangeStream {
   type Item = StateChange;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(change))) => {
               if let Some(id) = self.connection_id
                  && change.connection_id != id
               {
                  continue;
               }
               return Poll::Ready(Some(change));
            }
            Poll::Ready(Some(Err(err))) => {
               warn!(
                  error = %err,
                  "State change stream lagged; consider raising event_channel_capacity"
               );
               continue;
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use futures::StreamExt;

   use super::*;

   #[tokio::test]
   async fn test_stream_filters_by_connection() {
      let broker = StateChangeBroker::new(16);
      let wanted = Uuid::new_v4();
      let other = Uuid::new_v4();
      let mut stream = StateChangeStream::new(broker.subscribe()).for_connection(wanted);

      broker.publish(other, ConnectionState::Closed, ConnectionState::Connecting);
      broker.publish(wanted, ConnectionState::Closed, ConnectionState::Connecting);

      let change = stream.next().await.unwrap();
      assert_eq!(change.connection_id, wanted);
      assert_eq!(change.current, ConnectionState::Connecting);
   }

   #[tokio::test]
   async fn test_same_state_is_not_published() {
      let broker = StateChangeBroker::new(16);
      let mut rx = broker.subscribe();
      let id = Uuid::new_v4();

      broker.publish(id, ConnectionState::Open, ConnectionState::Open);
      broker.publish(id, ConnectionState::Open, ConnectionState::Closed);

      assert_eq!(rx.recv().await.unwrap().current, ConnectionState::Closed);
   }

   #[tokio::test]
   async fn test_lagged_stream_keeps_going() {
      let broker = StateChangeBroker::new(1);
      let mut stream = StateChangeStream::new(broker.subscribe());
      let id = Uuid::new_v4();

      broker.publish(id, ConnectionState::Closed, ConnectionState::Connecting);
      broker.publish(id, ConnectionState::Connecting, ConnectionState::Open);

      let change = stream.next().await.unwrap();
      assert_eq!(change.current, ConnectionState::Open);
   }
}
