//! An in-process stand-in for the coordinator, inbox, push and payment
//! nodes.

use heart_api::remote::*;
use heart_api::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    calls: Vec<(String, AccountId)>,
    inbox: HashMap<AccountId, Vec<InboxPacket>>,
    topics: HashMap<AccountId, Vec<SpaceId>>,
    inbox_tokens: Vec<String>,
    push_tokens: Vec<PushRegisterToken>,
    push_notifies: Vec<PushNotify>,
    verification_emails: Vec<GetVerificationEmailRequest>,
}

/// Answers every remote-service method in memory and records who called
/// what. Can be switched offline to simulate an unreachable network.
#[derive(Debug)]
pub struct FakeRemote {
    key: ed25519_dalek::SigningKey,
    available: AtomicBool,
    network: NetworkConfiguration,
    state: Mutex<State>,
}

impl FakeRemote {
    /// A fake that is online.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            key: ed25519_dalek::SigningKey::from_bytes(&[0xc0; 32]),
            available: AtomicBool::new(true),
            network: NetworkConfiguration {
                network_id: "test-network".into(),
                nodes: Vec::new(),
            },
            state: Mutex::new(State::default()),
        })
    }

    /// This fake as an rpc client.
    pub fn client(self: &Arc<Self>) -> DynRpcClient {
        self.clone()
    }

    /// Go on or offline.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Methods called so far.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Number of calls of `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.state().calls.iter().filter(|(m, _)| m == method).count()
    }

    /// Verification email requests received.
    pub fn verification_emails(&self) -> Vec<GetVerificationEmailRequest> {
        self.state().verification_emails.clone()
    }

    /// Push tokens registered.
    pub fn push_tokens(&self) -> Vec<PushRegisterToken> {
        self.state().push_tokens.clone()
    }

    /// Push notifications sent.
    pub fn push_notifies(&self) -> Vec<PushNotify> {
        self.state().push_notifies.clone()
    }

    /// Inbox tokens set.
    pub fn inbox_tokens(&self) -> Vec<String> {
        self.state().inbox_tokens.clone()
    }

    /// Queue a packet for `to`, as if another account sent it.
    pub fn deliver(&self, to: AccountId, packet: InboxPacket) {
        self.state().inbox.entry(to).or_default().push(packet);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn serve(&self, method: &str, payload: &[u8]) -> HeartResult<bytes::Bytes> {
        let signed: SignedPayload = serde_json::from_slice(payload)
            .map_err(|e| HeartError::kind_src(ErrorKind::BadInput, "decode", e))?;
        let who = signed.identity.clone();
        self.state().calls.push((method.to_string(), who.clone()));

        match method {
            method::COORDINATOR_NETWORK_CONFIGURATION => {
                let _: Empty = signed.verify()?;
                encode(&self.network)
            }
            method::COORDINATOR_SPACE_SIGN => {
                let req: SpaceSignRequest = signed.verify()?;
                let valid_until = Timestamp::now().as_unix_secs() + 86400 * 30;
                let msg = format!("{}/{}/{}", req.space_id, who, valid_until);
                let signature = ed25519_dalek::Signer::sign(&self.key, msg.as_bytes());
                encode(&SpaceReceipt {
                    space_id: req.space_id,
                    account: who,
                    valid_until,
                    signature: bytes::Bytes::copy_from_slice(
                        &signature.to_bytes(),
                    ),
                })
            }
            method::INBOX_SET_TOKEN => {
                let req: InboxSetToken = signed.verify()?;
                self.state().inbox_tokens.push(req.token);
                encode(&Empty {})
            }
            method::INBOX_SUBSCRIBE_ALL | method::INBOX_CREATE_SPACE => {
                let req: InboxTopics = signed.verify()?;
                let mut state = self.state();
                let topics = state.topics.entry(who).or_default();
                for s in req.space_ids {
                    if !topics.contains(&s) {
                        topics.push(s);
                    }
                }
                encode(&Empty {})
            }
            method::INBOX_NOTIFY => {
                let req: InboxNotify = signed.verify()?;
                self.state().inbox.entry(req.to).or_default().push(req.packet);
                encode(&Empty {})
            }
            method::INBOX_SUBSCRIPTIONS => {
                let _: Empty = signed.verify()?;
                let mut state = self.state();
                let pending = state.inbox.remove(&who).unwrap_or_default();
                let space_ids =
                    state.topics.get(&who).cloned().unwrap_or_default();
                encode(&InboxSubscriptions { space_ids, pending })
            }
            method::PUSH_REGISTER_TOKEN => {
                let req: PushRegisterToken = signed.verify()?;
                self.state().push_tokens.push(req);
                encode(&Empty {})
            }
            method::PUSH_NOTIFY => {
                let req: PushNotify = signed.verify()?;
                self.state().push_notifies.push(req);
                encode(&Empty {})
            }
            method::PAYMENT_GET_VERIFICATION_EMAIL => {
                let req: GetVerificationEmailRequest = signed.verify()?;
                self.state().verification_emails.push(req);
                encode(&Empty {})
            }
            method::PAYMENT_VERIFY_EMAIL_CODE => {
                let req: VerifyEmailCodeRequest = signed.verify()?;
                if req.code != "1234" {
                    return Err(HeartError::bad_input("wrong code"));
                }
                encode(&Empty {})
            }
            other => Err(HeartError::not_found(format!("method {other}"))),
        }
    }
}

fn encode<T: serde::Serialize>(v: &T) -> HeartResult<bytes::Bytes> {
    serde_json::to_vec(v)
        .map(Into::into)
        .map_err(|e| HeartError::other_src("encode", e))
}

impl RpcClient for FakeRemote {
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: bytes::Bytes,
    ) -> BoxFut<'a, HeartResult<bytes::Bytes>> {
        Box::pin(async move {
            if !self.available.load(Ordering::SeqCst) {
                return Err(HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "fake remote offline",
                ));
            }
            self.serve(method, &payload)
        })
    }
}
