//! [`OvirtApi`] over the engine's REST API and the imageio data path.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use polyfs_types::{Address, RealmKey};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};

use super::api::{
    Disk, EngineSession, ImageTransfer, OvirtApi, StorageDomain, TransferDirection,
};
use crate::error::{FsError, FsResult};

const API: &str = "/ovirt-engine/api";
const SSO_TOKEN: &str = "/ovirt-engine/sso/oauth/token";
const SSO_REVOKE: &str = "/ovirt-engine/services/sso-logout";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct DomainList {
    #[serde(default)]
    storage_domain: Vec<StorageDomain>,
}

#[derive(Deserialize)]
struct DiskList {
    #[serde(default)]
    disk: Vec<Disk>,
}

/// REST client; one `reqwest` client per engine so each can carry its own
/// TLS settings from the address properties (`certificate`, `insecure`).
#[derive(Debug)]
pub struct RestApi {
    timeout: Duration,
    clients: DashMap<RealmKey, Client>,
}

impl RestApi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: DashMap::new(),
        }
    }

    fn base_url(engine: &Address) -> String {
        match engine.port() {
            Some(port) => format!("https://{}:{port}", engine.host()),
            None => format!("https://{}", engine.host()),
        }
    }

    fn client(&self, engine: &Address) -> FsResult<Client> {
        let key = engine.root().realm_key();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(path) = engine.property("certificate") {
            let pem = std::fs::read(path)
                .map_err(|e| FsError::backend(format!("cannot read CA bundle {path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| FsError::backend(format!("invalid CA bundle {path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if engine.property("insecure") == Some("true") {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| FsError::backend(format!("could not build HTTP client: {e}")))?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    fn api(&self, session: &EngineSession, method: Method, path: &str) -> FsResult<RequestBuilder> {
        let url = format!("{}{API}{path}", Self::base_url(&session.engine));
        trace!(%method, %url, "engine request");
        Ok(self
            .client(&session.engine)?
            .request(method, url)
            .bearer_auth(&session.token)
            .header(header::ACCEPT, "application/json"))
    }

    async fn send(&self, session: &EngineSession, request: RequestBuilder) -> FsResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| FsError::backend(format!("engine request failed: {e}")))?;
        check_status(&session.engine, response).await
    }

    async fn json<T: DeserializeOwned>(
        &self,
        session: &EngineSession,
        request: RequestBuilder,
    ) -> FsResult<T> {
        self.send(session, request)
            .await?
            .json()
            .await
            .map_err(|e| FsError::backend(format!("unexpected engine response: {e}")))
    }
}

/// Non-2xx responses become errors; 401 is an authentication error.
async fn check_status(engine: &Address, response: Response) -> FsResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(FsError::auth_rejected(engine, format!("{status}: {body}")));
    }
    Err(FsError::backend(format!("{url} returned {status}: {body}")))
}

#[async_trait]
impl OvirtApi for RestApi {
    async fn login(&self, engine: &Address) -> FsResult<EngineSession> {
        let creds = engine
            .credentials()
            .ok_or_else(|| FsError::auth_required(engine))?;
        let url = format!("{}{SSO_TOKEN}", Self::base_url(engine));
        let response = self
            .client(engine)?
            .post(url)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "password"),
                ("scope", "ovirt-app-api"),
                ("username", creds.login()),
                ("password", creds.password().unwrap_or_default()),
            ])
            .send()
            .await
            .map_err(|e| FsError::backend(format!("SSO request failed: {e}")))?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FsError::backend(format!("unexpected SSO response: {e}")))?;
        match token.access_token {
            Some(token) => {
                debug!(engine = %engine.without_credentials(), "SSO login");
                Ok(EngineSession {
                    engine: engine.root().without_credentials(),
                    token,
                })
            }
            None => Err(FsError::auth_rejected(
                engine,
                token
                    .error_description
                    .or(token.error)
                    .unwrap_or_else(|| "no access token".to_string()),
            )),
        }
    }

    async fn logout(&self, session: &EngineSession) -> FsResult<()> {
        let url = format!("{}{SSO_REVOKE}", Self::base_url(&session.engine));
        let request = self
            .client(&session.engine)?
            .get(url)
            .bearer_auth(&session.token);
        self.send(session, request).await.map(drop)
    }

    async fn ping(&self, session: &EngineSession) -> FsResult<()> {
        let request = self.api(session, Method::GET, "")?;
        self.send(session, request).await.map(drop)
    }

    async fn storage_domains(&self, session: &EngineSession) -> FsResult<Vec<StorageDomain>> {
        let request = self.api(session, Method::GET, "/storagedomains")?;
        let list: DomainList = self.json(session, request).await?;
        Ok(list.storage_domain)
    }

    async fn disks(&self, session: &EngineSession, domain_id: &str) -> FsResult<Vec<Disk>> {
        let request = self.api(
            session,
            Method::GET,
            &format!("/storagedomains/{domain_id}/disks"),
        )?;
        let list: DiskList = self.json(session, request).await?;
        Ok(list.disk)
    }

    async fn create_disk(
        &self,
        session: &EngineSession,
        domain_id: &str,
        name: &str,
        size: u64,
    ) -> FsResult<Disk> {
        let body = json!({
            "name": name,
            "alias": name,
            "provisioned_size": size,
            "format": "raw",
            "sparse": true,
            "storage_domains": { "storage_domain": [{ "id": domain_id }] },
        });
        let request = self.api(session, Method::POST, "/disks")?.json(&body);
        self.json(session, request).await
    }

    async fn delete_disk(&self, session: &EngineSession, disk_id: &str) -> FsResult<()> {
        let request = self.api(session, Method::DELETE, &format!("/disks/{disk_id}"))?;
        self.send(session, request).await.map(drop)
    }

    async fn start_transfer(
        &self,
        session: &EngineSession,
        disk_id: &str,
        direction: TransferDirection,
    ) -> FsResult<ImageTransfer> {
        let body = json!({
            "disk": { "id": disk_id },
            "direction": direction.to_string(),
        });
        let request = self.api(session, Method::POST, "/imagetransfers")?.json(&body);
        self.json(session, request).await
    }

    async fn transfer(
        &self,
        session: &EngineSession,
        transfer_id: &str,
    ) -> FsResult<ImageTransfer> {
        let request = self.api(
            session,
            Method::GET,
            &format!("/imagetransfers/{transfer_id}"),
        )?;
        self.json(session, request).await
    }

    async fn finalize_transfer(&self, session: &EngineSession, transfer_id: &str) -> FsResult<()> {
        let request = self
            .api(
                session,
                Method::POST,
                &format!("/imagetransfers/{transfer_id}/finalize"),
            )?
            .json(&json!({}));
        self.send(session, request).await.map(drop)
    }

    async fn cancel_transfer(&self, session: &EngineSession, transfer_id: &str) -> FsResult<()> {
        let request = self
            .api(
                session,
                Method::POST,
                &format!("/imagetransfers/{transfer_id}/cancel"),
            )?
            .json(&json!({}));
        self.send(session, request).await.map(drop)
    }

    async fn read_range(
        &self,
        session: &EngineSession,
        url: &str,
        offset: u64,
        len: u64,
    ) -> FsResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let request = self
            .client(&session.engine)?
            .get(url)
            .header(header::RANGE, format!("bytes={offset}-{}", offset + len - 1));
        self.send(session, request)
            .await?
            .bytes()
            .await
            .map_err(|e| FsError::backend(format!("reading {url} at {offset}: {e}")))
    }

    async fn write_range(
        &self,
        session: &EngineSession,
        url: &str,
        offset: u64,
        data: Bytes,
    ) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64 - 1;
        let request = self
            .client(&session.engine)?
            .put(url)
            .header(header::CONTENT_RANGE, format!("bytes {offset}-{end}/*"))
            .body(data);
        self.send(session, request).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let engine = Address::parse("ovirt://admin%40internal:pw@engine.lab:8443/").unwrap();
        assert_eq!(RestApi::base_url(&engine), "https://engine.lab:8443");
        let plain = Address::parse("ovirt://engine.lab/").unwrap();
        assert_eq!(RestApi::base_url(&plain), "https://engine.lab");
    }

    #[test]
    fn test_client_cached_per_engine() {
        let api = RestApi::new(Duration::from_secs(5));
        let a = Address::parse("ovirt://engine.lab/data/disk").unwrap();
        let b = Address::parse("ovirt://ENGINE.lab/other").unwrap();
        api.client(&a).unwrap();
        api.client(&b).unwrap();
        assert_eq!(api.clients.len(), 1);
    }

    #[test]
    fn test_missing_ca_bundle() {
        let api = RestApi::new(Duration::from_secs(5));
        let engine =
            Address::parse("ovirt://engine.lab;certificate=%2Fnonexistent%2Fca.pem/").unwrap();
        assert!(api.client(&engine).is_err());
    }
}
