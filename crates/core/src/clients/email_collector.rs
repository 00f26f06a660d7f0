use super::*;
use heart_api::kv::*;
use std::sync::Mutex;

/// Key of the pending request in the local store.
pub const EMAIL_COLLECTOR_KEY: &[u8] = b"emailCollector";

struct Inner {
    config: EmailCollectorConfig,
    store: DynKvStore,
    payment: PaymentClient,
}

/// Sends a stored verification-email request once the payment node is
/// reachable. The request survives restarts; a sent request is kept with
/// an empty email so later ticks are no-ops.
pub struct EmailCollector {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for EmailCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailCollector")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Drop for EmailCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EmailCollector {
    /// Construct an idle collector; see [EmailCollector::start].
    pub fn new(
        config: EmailCollectorConfig,
        store: DynKvStore,
        payment: PaymentClient,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                payment,
            }),
            task: Mutex::new(None),
        }
    }

    /// Tick on the configured interval until dropped. Does nothing
    /// outside the default network.
    pub fn start(&self) {
        if self.inner.payment.mode() != NetworkMode::Default {
            tracing::debug!("email collector off outside the default network");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }
        *task = Some(tokio::task::spawn(tick_loop(Arc::downgrade(&self.inner))));
    }

    /// Stop ticking. A stored request is kept for the next start.
    pub fn stop(&self) {
        if let Some(t) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            t.abort();
        }
    }

    /// Persist a request, replacing the previous one.
    pub fn set_request(&self, req: &GetVerificationEmailRequest) -> HeartResult<()> {
        self.inner
            .store
            .write_batch(vec![put_json_op(EMAIL_COLLECTOR_KEY, req)?])
    }

    /// The stored request.
    pub fn request(&self) -> HeartResult<Option<GetVerificationEmailRequest>> {
        get_json(&*self.inner.store, EMAIL_COLLECTOR_KEY)
    }

    /// Send the stored request if there is one. Returns true if a request
    /// went out.
    pub async fn tick(&self) -> HeartResult<bool> {
        self.inner.tick().await
    }
}

impl Inner {
    async fn tick(&self) -> HeartResult<bool> {
        if self.payment.mode() != NetworkMode::Default {
            return Ok(false);
        }
        let Some(mut req) =
            get_json::<GetVerificationEmailRequest>(&*self.store, EMAIL_COLLECTOR_KEY)?
        else {
            return Ok(false);
        };
        if req.email.is_empty() {
            return Ok(false);
        }
        tokio::time::timeout(
            self.config.tick_timeout(),
            self.payment.get_verification_email(&req),
        )
        .await
        .map_err(|_| {
            HeartError::kind(ErrorKind::TransportUnavailable, "verification email timed out")
        })??;
        req.email.clear();
        self.store
            .write_batch(vec![put_json_op(EMAIL_COLLECTOR_KEY, &req)?])?;
        tracing::info!("verification email requested");
        Ok(true)
    }
}

async fn tick_loop(inner: std::sync::Weak<Inner>) {
    let interval = match inner.upgrade() {
        Some(i) => i.config.tick_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = inner.tick().await {
            tracing::warn!(?err, "email collector tick failed");
        }
    }
}
