use super::*;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct PushState {
    registered: bool,
    queue: Vec<PushNotify>,
}

/// Client of the push notification node. Notifications sent before a
/// token is registered wait in a queue.
#[derive(Debug)]
pub struct PushClient {
    remote: Remote,
    state: Mutex<PushState>,
}

impl PushClient {
    pub(crate) fn new(remote: Remote) -> Self {
        Self {
            remote,
            state: Mutex::new(PushState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// True once a token was registered.
    pub fn is_registered(&self) -> bool {
        self.state().registered
    }

    /// Notifications waiting for registration.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Register this device and send what was queued.
    pub async fn register_token(
        &self,
        token: impl Into<String>,
        platform: PushPlatform,
    ) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(
                method::PUSH_REGISTER_TOKEN,
                &PushRegisterToken {
                    token: token.into(),
                    platform,
                },
            )
            .await?;
        let queue = {
            let mut state = self.state();
            state.registered = true;
            std::mem::take(&mut state.queue)
        };
        let mut queue = queue.into_iter();
        while let Some(req) = queue.next() {
            if let Err(err) = self.send(&req).await {
                let mut state = self.state();
                let rest = std::mem::take(&mut state.queue);
                state.queue = std::iter::once(req).chain(queue).chain(rest).collect();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Notify the devices subscribed to `topics` of `space`.
    pub async fn notify(
        &self,
        space: SpaceId,
        topics: Vec<String>,
        payload: bytes::Bytes,
    ) -> HeartResult<()> {
        let req = PushNotify {
            space,
            topics,
            payload,
        };
        {
            let mut state = self.state();
            if !state.registered {
                tracing::debug!(space = %req.space, "push queued until registered");
                state.queue.push(req);
                return Ok(());
            }
        }
        self.send(&req).await
    }

    async fn send(&self, req: &PushNotify) -> HeartResult<()> {
        let _: Empty = self.remote.call(method::PUSH_NOTIFY, req).await?;
        Ok(())
    }
}
