//! Factory and account lifecycle.
//!
//! The factory constructs provider handles from `(kind, init data)`,
//! sharing one transport, one embedded server and one event loop. It owns
//! the per-process state counter that disambiguates concurrently
//! authorizing handles, the OAuth redirect endpoints (one per shipped
//! kind, plus the static asset routes), and account persistence.
//!
//! Consent flow end-to-end: the caller opens `authorization_url(kind)`,
//! the provider redirects to `/<kind>?code=...` on the embedded server,
//! the handler exchanges the code and a fresh account is announced through
//! [`FactoryCallback::on_cloud_created`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cirrus_core::domain::token::hint;
use cirrus_core::{CloudError, CloudResult, Config, Hints, ProviderKind, Token};
use cirrus_http::{
    HttpServerFactory, RequestHandler, ServerHandle, ServerKind, ServerRequest, ServerResponse,
    Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::access::{CloudAccess, CloudHandle};
use crate::auth::AuthCallback;
use crate::event_loop::EventLoop;
use crate::file_server::FileServer;
use crate::pages;
use crate::providers;

/// Access level requested for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    ReadMetaData,
    Read,
    #[default]
    ReadWrite,
}

/// Initialization data for one provider handle.
#[derive(Debug, Clone, Default)]
pub struct ProviderInitData {
    /// Token from a previous run; empty means unauthorized.
    pub token: String,
    pub hints: Hints,
    pub permission: Permission,
}

/// Notifications about account lifecycle, dispatched on the event loop.
pub trait FactoryCallback: Send + Sync {
    fn on_cloud_token_received(&self, kind: ProviderKind, result: &CloudResult<Token>) {
        let _ = (kind, result);
    }

    fn on_cloud_created(&self, cloud: &CloudAccess) {
        let _ = cloud;
    }

    fn on_cloud_removed(&self, cloud: &CloudAccess) {
        let _ = cloud;
    }
}

/// Everything the factory shares across handles.
pub struct FactoryInit {
    pub transport: Transport,
    pub server: HttpServerFactory,
    pub config: Config,
    pub auth_callback: Arc<dyn AuthCallback>,
    pub callback: Option<Arc<dyn FactoryCallback>>,
    pub runtime: tokio::runtime::Handle,
}

struct Account {
    access: CloudAccess,
    _file_server: FileServer,
}

/// Constructs, tracks and persists provider accounts.
pub struct CloudFactory {
    transport: Transport,
    server: HttpServerFactory,
    config: Mutex<Config>,
    auth_callback: Arc<dyn AuthCallback>,
    callback: Option<Arc<dyn FactoryCallback>>,
    runtime: tokio::runtime::Handle,
    event_loop: EventLoop,
    state_counter: AtomicU64,
    /// Accounts keyed by their state string.
    accounts: Mutex<HashMap<String, Account>>,
    /// Keeps the redirect and static routes registered.
    routes: Mutex<Vec<ServerHandle>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedProvider {
    #[serde(rename = "type")]
    kind: ProviderKind,
    token: String,
    #[serde(default)]
    access_token: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedAccounts {
    providers: Vec<PersistedProvider>,
}

impl CloudFactory {
    pub fn new(init: FactoryInit) -> Arc<Self> {
        let factory = Arc::new(Self {
            transport: init.transport,
            server: init.server,
            config: Mutex::new(init.config),
            auth_callback: init.auth_callback,
            callback: init.callback,
            runtime: init.runtime,
            event_loop: EventLoop::new(),
            state_counter: AtomicU64::new(0),
            accounts: Mutex::new(HashMap::new()),
            routes: Mutex::new(Vec::new()),
        });

        let mut routes = Vec::new();
        for kind in providers::available() {
            let endpoint = Arc::new(AuthEndpoint {
                factory: Arc::downgrade(&factory),
                kind,
            });
            routes.push(
                factory
                    .server
                    .create(kind.name(), ServerKind::Authorization, endpoint),
            );
        }
        let assets: Arc<dyn RequestHandler> = Arc::new(AssetEndpoint);
        routes.push(
            factory
                .server
                .create("static", ServerKind::FileProvider, Arc::clone(&assets)),
        );
        routes.push(
            factory
                .server
                .create("favicon.ico", ServerKind::FileProvider, assets),
        );
        *factory.routes.lock().unwrap() = routes;
        factory
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Drains pending user callbacks on the calling thread.
    pub fn process_events(&self) {
        self.event_loop.process_events();
    }

    /// Blocks draining callbacks until [`CloudFactory::quit`].
    pub fn exec(&self) {
        self.event_loop.exec();
    }

    pub fn quit(&self) {
        self.event_loop.quit();
    }

    /// Kinds a handle can be created for.
    pub fn available_providers(&self) -> Vec<ProviderKind> {
        providers::available()
    }

    pub fn load_config(&self, reader: impl std::io::Read) -> anyhow::Result<()> {
        let config: Config = serde_json::from_reader(reader)?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    fn build_hints(&self, kind: ProviderKind, mut hints: Hints) -> Hints {
        let index = self.state_counter.fetch_add(1, Ordering::SeqCst);
        let state = format!("{}-{index}", kind.name());
        let base = self.server.base_url().trim_end_matches('/');
        hints.insert(hint::STATE.into(), state.clone());
        hints.insert(hint::FILE_URL.into(), format!("{base}/{state}"));
        hints
            .entry(hint::REDIRECT_URI.into())
            .or_insert_with(|| format!("{base}/{}", kind.name()));
        let config = self.config.lock().unwrap();
        if let Some(keys) = config.keys_for(kind.name()) {
            hints
                .entry(hint::CLIENT_ID.into())
                .or_insert_with(|| keys.client_id.clone());
            hints
                .entry(hint::CLIENT_SECRET.into())
                .or_insert_with(|| keys.client_secret.clone());
        }
        hints
    }

    fn build_handle(
        &self,
        kind: ProviderKind,
        data: ProviderInitData,
    ) -> CloudResult<CloudHandle> {
        let adapter = providers::adapter_for(kind)
            .ok_or_else(|| CloudError::aborted())?;
        let hints = self.build_hints(kind, data.hints);
        let token = if data.token.is_empty() {
            None
        } else {
            Some(Token::new(data.token, ""))
        };
        Ok(CloudHandle::new(
            adapter,
            self.transport.clone(),
            Arc::clone(&self.auth_callback),
            token,
            hints,
        ))
    }

    /// Creates a provider handle, registers its streaming endpoint and
    /// tracks it as an account.
    pub fn create(
        &self,
        kind: ProviderKind,
        data: ProviderInitData,
    ) -> CloudResult<CloudAccess> {
        let handle = Arc::new(self.build_handle(kind, data)?);
        let file_server = FileServer::create(
            Arc::clone(&handle),
            &self.server,
            self.runtime.clone(),
        );
        let access = CloudAccess::new(handle, self.runtime.clone(), self.event_loop.clone());
        let state = access.handle().state().to_string();
        info!(kind = %kind, state, "provider handle created");
        self.accounts.lock().unwrap().insert(
            state,
            Account {
                access: access.clone(),
                _file_server: file_server,
            },
        );
        Ok(access)
    }

    /// Removes an account, cancelling everything in flight on it.
    pub fn remove(&self, access: &CloudAccess) {
        let state = access.handle().state().to_string();
        let removed = self.accounts.lock().unwrap().remove(&state);
        if let Some(account) = removed {
            account.access.handle().shutdown();
            self.emit_removed(account.access);
        }
    }

    /// Currently tracked accounts.
    pub fn accounts(&self) -> Vec<CloudAccess> {
        self.accounts
            .lock()
            .unwrap()
            .values()
            .map(|account| account.access.clone())
            .collect()
    }

    /// The consent URL for a kind, using a throwaway handle.
    pub fn authorization_url(&self, kind: ProviderKind) -> CloudResult<String> {
        Ok(self.build_handle(kind, ProviderInitData::default())?.authorize_url())
    }

    /// Exchanges an out-of-band authorization code for a live account.
    pub async fn exchange_authorization_code(
        &self,
        kind: ProviderKind,
        data: ProviderInitData,
        code: &str,
    ) -> CloudResult<CloudAccess> {
        let probe = self.build_handle(kind, data.clone())?;
        let cancel = probe.child_token();
        let result = probe.exchange_code(code, &cancel).await;
        if let Some(callback) = &self.callback {
            callback.on_cloud_token_received(kind, &result);
        }
        let token = result?;
        let mut hints = data.hints;
        hints.insert(hint::ACCESS_TOKEN.into(), token.access_token.clone());
        let access = self.create(
            kind,
            ProviderInitData {
                token: token.token,
                hints,
                permission: data.permission,
            },
        )?;
        self.emit_created(access.clone());
        Ok(access)
    }

    /// Writes `{providers: [{type, token, access_token}]}` for every
    /// tracked account.
    pub fn dump_accounts(&self, writer: impl std::io::Write) -> anyhow::Result<()> {
        let providers = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .map(|account| {
                let handle = account.access.handle();
                PersistedProvider {
                    kind: handle.kind(),
                    token: handle.token(),
                    access_token: handle
                        .hints()
                        .get(hint::ACCESS_TOKEN)
                        .cloned()
                        .unwrap_or_default(),
                }
            })
            .collect();
        serde_json::to_writer(writer, &PersistedAccounts { providers })?;
        Ok(())
    }

    /// Restores accounts previously written by
    /// [`CloudFactory::dump_accounts`], announcing each through the
    /// creation callback.
    pub fn load_accounts(&self, reader: impl std::io::Read) -> anyhow::Result<()> {
        let persisted: PersistedAccounts = serde_json::from_reader(reader)?;
        for provider in persisted.providers {
            let mut hints = Hints::new();
            if !provider.access_token.is_empty() {
                hints.insert(hint::ACCESS_TOKEN.into(), provider.access_token);
            }
            match self.create(
                provider.kind,
                ProviderInitData {
                    token: provider.token,
                    hints,
                    permission: Permission::ReadWrite,
                },
            ) {
                Ok(access) => self.emit_created(access),
                Err(err) => {
                    warn!(kind = %provider.kind, error = %err, "skipping unrestorable account")
                }
            }
        }
        Ok(())
    }

    /// Cancels everything in flight on every account.
    pub fn shutdown(&self) {
        for account in self.accounts.lock().unwrap().values() {
            account.access.handle().shutdown();
        }
    }

    fn emit_created(&self, access: CloudAccess) {
        if let Some(callback) = &self.callback {
            let callback = Arc::clone(callback);
            self.event_loop
                .invoke(move || callback.on_cloud_created(&access));
        }
    }

    fn emit_removed(&self, access: CloudAccess) {
        if let Some(callback) = &self.callback {
            let callback = Arc::clone(callback);
            self.event_loop
                .invoke(move || callback.on_cloud_removed(&access));
        }
    }

    /// Routes an authorization code to a handle parked on consent.
    fn deliver_code(&self, state: &str, code: &str) -> bool {
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(state) {
            Some(account) => account.access.handle().deliver_code(code),
            None => false,
        }
    }

    /// Page content override from the hints of the account owning `state`.
    fn page_override(&self, state: Option<&str>, key: &str) -> Option<String> {
        let state = state?;
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(state)
            .and_then(|account| account.access.handle().hints().get(key).cloned())
    }
}

/// Redirect endpoint for one provider kind.
struct AuthEndpoint {
    factory: Weak<CloudFactory>,
    kind: ProviderKind,
}

impl RequestHandler for AuthEndpoint {
    fn handle(&self, request: &ServerRequest) -> ServerResponse {
        let Some(factory) = self.factory.upgrade() else {
            return ServerResponse::not_found();
        };
        let state = request.query_param("state").map(str::to_string);
        if request.subpath().starts_with("/login") {
            let page = factory
                .page_override(state.as_deref(), hint::LOGIN_PAGE)
                .unwrap_or_else(|| pages::login_page(self.kind));
            return ServerResponse::html(200, page);
        }
        if let Some(code) = request.query_param("code") {
            let success = factory
                .page_override(state.as_deref(), hint::SUCCESS_PAGE)
                .unwrap_or_else(|| pages::DEFAULT_SUCCESS_HTML.to_string());
            // A handle parked mid-authorization takes priority; otherwise
            // the code births a brand-new account.
            if let Some(state) = state.as_deref() {
                if factory.deliver_code(state, code) {
                    return ServerResponse::html(200, success);
                }
            }
            let kind = self.kind;
            let code = code.to_string();
            let spawned = Arc::clone(&factory);
            factory.runtime.spawn(async move {
                if let Err(err) = spawned
                    .exchange_authorization_code(kind, ProviderInitData::default(), &code)
                    .await
                {
                    warn!(kind = %kind, error = %err, "code exchange failed");
                }
            });
            return ServerResponse::html(200, success);
        }
        if let Some(error) = request.query_param("error") {
            warn!(kind = %self.kind, error, "authorization redirect with error");
            let page = factory
                .page_override(state.as_deref(), hint::ERROR_PAGE)
                .unwrap_or_else(|| pages::DEFAULT_ERROR_HTML.to_string());
            return ServerResponse::html(400, page);
        }
        ServerResponse::bad_request("")
    }
}

/// Serves `/static/<asset>` and `/favicon.ico`.
struct AssetEndpoint;

impl RequestHandler for AssetEndpoint {
    fn handle(&self, request: &ServerRequest) -> ServerResponse {
        let name = if request.path.trim_start_matches('/') == "favicon.ico" {
            "favicon.ico"
        } else {
            request.last_segment()
        };
        match pages::static_asset(name) {
            Some((body, mime)) => {
                ServerResponse::ok(bytes::Bytes::from_static(body)).header("Content-Type", mime)
            }
            None => ServerResponse::not_found(),
        }
    }
}
