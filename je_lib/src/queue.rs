use std::io;

use async_trait::async_trait;
use je_data::JobSnapshot;
use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    job::Job,
};

/// Topic based publish side of a message bus. Delivery is best effort.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: String) -> io::Result<()>;
}

type PublishHook = Box<dyn Fn(&JobSnapshot) + Send + Sync>;

/// Publishes job snapshots as JSON on a topic named after the job.
pub struct MessageBusQueue<B> {
    bus: B,
    // optional local fan-out, called after every successful publish
    hooks: Vec<PublishHook>,
}

impl<B: MessageBus> MessageBusQueue<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            hooks: Vec::new(),
        }
    }

    pub fn on_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    pub async fn publish(&self, job: &Job) -> Result<()> {
        self.publish_snapshot(&job.snapshot().await).await
    }

    pub async fn publish_snapshot(&self, snapshot: &JobSnapshot) -> Result<()> {
        let message = serde_json::to_string(snapshot).map_err(|source| {
            error!("error marshalling job {}: {}", snapshot.id, source);
            Error::Codec {
                id: snapshot.id,
                source,
            }
        })?;
        self.bus
            .publish(&snapshot.name, message)
            .await
            .map_err(|source| Error::Bus {
                id: snapshot.id,
                topic: snapshot.name.clone(),
                source,
            })?;
        debug!("published job {} on topic {}", snapshot.id, snapshot.name);
        for hook in &self.hooks {
            hook(snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use je_data::{JobSnapshot, JobSpec, State};

    use super::{MessageBus, MessageBusQueue};
    use crate::{
        error::Error,
        job_pool::JobPool,
        store::{MemoryDataStore, MemoryJobStore},
        testing::{setup, RUNTIME},
    };

    #[derive(Default, Clone)]
    struct RecordingBus {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        down: bool,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, message: String) -> io::Result<()> {
            if self.down {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "bus down"));
            }
            self.sent.lock().unwrap().push((topic.to_string(), message));
            Ok(())
        }
    }

    #[test]
    fn test_publish_on_job_name() {
        setup();
        let pool = JobPool::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryDataStore::new()),
        );
        let bus = RecordingBus::default();
        let published = Arc::new(AtomicUsize::new(0));
        let queue = {
            let published = published.clone();
            MessageBusQueue::new(bus.clone()).on_publish(move |_| {
                published.fetch_add(1, Ordering::SeqCst);
            })
        };
        RUNTIME.block_on(async {
            let job = pool.submit(JobSpec::new("echo", &["hello"])).await.unwrap();
            queue.publish(&job).await.unwrap();
        });

        let sent = bus.sent.lock().unwrap();
        assert_eq!(1, sent.len());
        assert_eq!("echo", sent[0].0);
        let snapshot: JobSnapshot = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(State::Waiting, snapshot.state);
        assert_eq!(vec!["hello".to_string()], snapshot.args);
        assert_eq!(1, published.load(Ordering::SeqCst));
    }

    #[test]
    fn test_publish_failure_skips_hooks() {
        setup();
        let bus = RecordingBus {
            down: true,
            ..RecordingBus::default()
        };
        let queue = MessageBusQueue::new(bus).on_publish(|_| panic!("hook must not run"));
        let snapshot = JobSnapshot::new(je_data::JobId(1), JobSpec::new("ls", &[]));
        let result = RUNTIME.block_on(queue.publish_snapshot(&snapshot));
        match result {
            Err(Error::Bus { topic, .. }) => assert_eq!("ls", topic),
            other => panic!("expected bus error, got: {:?}", other),
        }
    }
}
