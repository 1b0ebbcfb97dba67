use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use zbus::zvariant::Value;

use crate::protocol::TransitionError;

/// Flag asking polkit to prompt the user when the action needs authentication.
const ALLOW_USER_INTERACTION: u32 = 1;

/// How many times the gate reconnects to a vanished authority before giving up.
const MAX_RECONNECTS: usize = 1;

/// Identity of a remote caller, resolved from the bus by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub sender: String,
    pub pid: u32,
}

/// Who is invoking a service operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallContext {
    /// Called in-process. Always authorised.
    Local,
    Remote(Caller),
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("policy authority is not on the bus: {0}")]
    ServiceUnknown(String),
    #[error("policy authority did not answer within {0:?}")]
    Timeout(Duration),
    #[error("policy authority error: {0}")]
    Other(String),
}

#[async_trait]
pub trait Authority: Send + Sync {
    /// Asks whether `caller` holds `action_id`. May block while the user is
    /// prompted for a password.
    async fn check(&self, caller: &Caller, action_id: &str) -> Result<bool, AuthorityError>;

    /// Drops the current authority connection so the next check opens a new one.
    async fn reconnect(&self);
}

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait PolkitAuthority {
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::fdo::Result<(bool, bool, HashMap<String, String>)>;
}

/// Polkit subject for `caller`. The unique bus name cannot be recycled while
/// the call is in flight, unlike a pid.
fn subject(caller: &Caller) -> (&'static str, HashMap<&'static str, Value<'_>>) {
    (
        "system-bus-name",
        HashMap::from([("name", Value::from(caller.sender.as_str()))]),
    )
}

/// Authority backed by polkitd on the system bus. The connection is opened
/// lazily and replaced after polkitd drops off the bus.
pub struct Polkit {
    proxy: Mutex<Option<PolkitAuthorityProxy<'static>>>,
    timeout: Duration,
}

impl Polkit {
    pub fn new(timeout: Duration) -> Self {
        Self {
            proxy: Mutex::new(None),
            timeout,
        }
    }

    async fn proxy(&self) -> Result<PolkitAuthorityProxy<'static>, AuthorityError> {
        let mut proxy = self.proxy.lock().await;
        if let Some(proxy) = proxy.as_ref() {
            return Ok(proxy.clone());
        }

        let connection = zbus::Connection::system()
            .await
            .map_err(|e| AuthorityError::Other(e.to_string()))?;
        let new_proxy = PolkitAuthorityProxy::new(&connection)
            .await
            .map_err(|e| AuthorityError::Other(e.to_string()))?;
        *proxy = Some(new_proxy.clone());

        Ok(new_proxy)
    }
}

#[async_trait]
impl Authority for Polkit {
    async fn check(&self, caller: &Caller, action_id: &str) -> Result<bool, AuthorityError> {
        let proxy = self.proxy().await?;

        let subject = subject(caller);

        let reply = tokio::time::timeout(
            self.timeout,
            proxy.check_authorization(
                &subject,
                action_id,
                HashMap::from([("", "")]),
                ALLOW_USER_INTERACTION,
                "",
            ),
        )
        .await
        .map_err(|_| AuthorityError::Timeout(self.timeout))?;

        match reply {
            Ok((is_authorized, _, _)) => Ok(is_authorized),
            Err(zbus::fdo::Error::ServiceUnknown(msg)) => Err(AuthorityError::ServiceUnknown(msg)),
            Err(e) => Err(AuthorityError::Other(e.to_string())),
        }
    }

    async fn reconnect(&self) {
        self.proxy.lock().await.take();
    }
}

/// Checks every service call against the policy authority.
pub struct AuthorizationGate<A> {
    authority: A,
    action_id: String,
    enforce: bool,
}

impl<A: Authority> AuthorizationGate<A> {
    pub fn new(authority: A, action_id: impl Into<String>) -> Self {
        Self {
            authority,
            action_id: action_id.into(),
            enforce: true,
        }
    }

    /// With enforcement off every remote caller is authorised. Testing only.
    pub fn enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub async fn authorize(&self, context: &CallContext) -> Result<(), TransitionError> {
        let caller = match context {
            CallContext::Local => return Ok(()),
            CallContext::Remote(caller) => caller,
        };

        if !self.enforce {
            tracing::debug!(
                target: "TransitionSystem::Authority",
                "Polkit enforcement disabled, allowing {}",
                caller.sender
            );
            return Ok(());
        }

        let mut reconnects = 0;
        loop {
            match self.authority.check(caller, &self.action_id).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::warn!(
                        target: "TransitionSystem::Authority",
                        "Denied {} to {} (pid {})",
                        self.action_id,
                        caller.sender,
                        caller.pid
                    );
                    return Err(TransitionError::PermissionDeniedByPolicy(
                        self.action_id.clone(),
                    ));
                }
                Err(AuthorityError::ServiceUnknown(msg)) if reconnects < MAX_RECONNECTS => {
                    tracing::warn!(
                        target: "TransitionSystem::Authority",
                        "Policy authority went away ({msg}), reconnecting"
                    );
                    reconnects += 1;
                    self.authority.reconnect().await;
                }
                Err(e) => return Err(TransitionError::AuthorityFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Answers checks from a script; an exhausted script grants.
    #[derive(Default)]
    pub(crate) struct ScriptedAuthority {
        pub answers: StdMutex<VecDeque<Result<bool, AuthorityError>>>,
        pub checks: StdMutex<usize>,
        pub reconnects: StdMutex<usize>,
    }

    impl ScriptedAuthority {
        pub(crate) fn with(answers: Vec<Result<bool, AuthorityError>>) -> Self {
            Self {
                answers: StdMutex::new(answers.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Authority for ScriptedAuthority {
        async fn check(&self, _: &Caller, _: &str) -> Result<bool, AuthorityError> {
            *self.checks.lock().unwrap() += 1;
            self.answers.lock().unwrap().pop_front().unwrap_or(Ok(true))
        }

        async fn reconnect(&self) {
            *self.reconnects.lock().unwrap() += 1;
        }
    }

    pub(crate) fn remote() -> CallContext {
        CallContext::Remote(Caller {
            sender: ":1.42".into(),
            pid: 4242,
        })
    }

    #[tokio::test]
    async fn local_calls_skip_the_authority() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![Ok(false)]),
            "org.example.act",
        );
        gate.authorize(&CallContext::Local).await.unwrap();
        assert_eq!(*gate.authority().checks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn denial_names_the_privilege() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![Ok(false)]),
            "org.example.act",
        );
        match gate.authorize(&remote()).await {
            Err(TransitionError::PermissionDeniedByPolicy(action)) => {
                assert_eq!(action, "org.example.act")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnects_once_when_authority_vanishes() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![
                Err(AuthorityError::ServiceUnknown("gone".into())),
                Ok(true),
            ]),
            "org.example.act",
        );
        gate.authorize(&remote()).await.unwrap();
        assert_eq!(*gate.authority().reconnects.lock().unwrap(), 1);
        assert_eq!(*gate.authority().checks.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn second_disappearance_propagates() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![
                Err(AuthorityError::ServiceUnknown("gone".into())),
                Err(AuthorityError::ServiceUnknown("still gone".into())),
            ]),
            "org.example.act",
        );
        assert!(matches!(
            gate.authorize(&remote()).await,
            Err(TransitionError::AuthorityFailed(_))
        ));
        assert_eq!(*gate.authority().checks.lock().unwrap(), 2);
        assert_eq!(*gate.authority().reconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn other_authority_errors_are_not_retried() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![Err(AuthorityError::Other("boom".into()))]),
            "org.example.act",
        );
        assert!(matches!(
            gate.authorize(&remote()).await,
            Err(TransitionError::AuthorityFailed(_))
        ));
        assert_eq!(*gate.authority().reconnects.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn enforcement_switch_allows_remote_callers() {
        let gate = AuthorizationGate::new(
            ScriptedAuthority::with(vec![Ok(false)]),
            "org.example.act",
        )
        .enforce(false);
        gate.authorize(&remote()).await.unwrap();
        assert_eq!(*gate.authority().checks.lock().unwrap(), 0);
    }

    #[test]
    fn subject_names_the_bus_connection() {
        let caller = Caller {
            sender: ":1.42".into(),
            pid: 4242,
        };

        let (kind, details) = subject(&caller);
        assert_eq!(kind, "system-bus-name");
        assert_eq!(details.len(), 1);
        assert_eq!(details["name"], Value::from(":1.42"));
    }
}
