// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;

/// A worker's view of the server-wide stop broadcast.
///
/// Fires once, on the first broadcast or when every sender is gone, and stays
/// fired afterwards.
#[derive(Debug)]
pub struct Shutdown {
    rx: broadcast::Receiver<()>,
    fired: bool,
}

impl Shutdown {
    pub fn subscribe(notify: &broadcast::Sender<()>) -> Shutdown {
        Shutdown {
            rx: notify.subscribe(),
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub async fn recv(&mut self) {
        if !self.fired {
            // Ok, Lagged and Closed all mean the stop was requested
            let _ = self.rx.recv().await;
            self.fired = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn test_fired_stays_fired() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe(&tx);
        assert!(!shutdown.fired());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.fired());

        // nothing more is sent, the second recv returns anyway
        time::timeout(Duration::from_millis(50), shutdown.recv())
            .await
            .expect("fired shutdown blocked");
    }

    #[tokio::test]
    async fn test_last_sender_gone_fires() {
        let (tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::subscribe(&tx);
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.fired());
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_later_broadcasts() {
        let (tx, _keep) = broadcast::channel(1);
        tx.send(()).unwrap();
        let mut shutdown = Shutdown::subscribe(&tx);
        assert!(time::timeout(Duration::from_millis(50), shutdown.recv())
            .await
            .is_err());
        assert!(!shutdown.fired());
    }
}
