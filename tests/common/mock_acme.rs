use anyhow::Result;
use data_encoding::BASE64URL_NOPAD;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::x509::X509Name;
use openssl::x509::X509;
use serde_json::json;
use serde_json::Value;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::ResponseTemplate;

static NONCES: AtomicUsize = AtomicUsize::new(0);

fn next_nonce() -> String {
  format!("nonce-{}", NONCES.fetch_add(1, Ordering::SeqCst))
}

/// A response carrying a fresh `Replay-Nonce`, like every ACME response.
pub fn acme_response(status: u16) -> ResponseTemplate {
  ResponseTemplate::new(status).insert_header("Replay-Nonce", next_nonce().as_str())
}

/// A problem document. It carries no nonce, so the client has to fetch one.
pub fn problem(status: u16, kind: &str) -> ResponseTemplate {
  ResponseTemplate::new(status)
    .insert_header("Content-Type", "application/problem+json")
    .set_body_json(json!({
      "type": format!("urn:ietf:params:acme:error:{}", kind),
      "detail": format!("mock {}", kind),
    }))
}

pub fn decode(part: &str) -> Vec<u8> {
  BASE64URL_NOPAD.decode(part.as_bytes()).unwrap()
}

fn body(req: &Request) -> Value {
  serde_json::from_slice(&req.body).unwrap()
}

/// The protected header of a signed request.
pub fn jws_header(req: &Request) -> Value {
  let body = body(req);
  serde_json::from_slice(&decode(body["protected"].as_str().unwrap())).unwrap()
}

pub fn jws_payload_raw(req: &Request) -> String {
  let body = body(req);
  String::from_utf8(decode(body["payload"].as_str().unwrap())).unwrap()
}

pub fn jws_payload(req: &Request) -> Value {
  serde_json::from_str(&jws_payload_raw(req)).unwrap()
}

pub fn self_signed_pem() -> Result<Vec<u8>> {
  let key = acme2_lifecycle::gen_ec_p256_private_key()?;
  let mut name = X509Name::builder()?;
  name.append_entry_by_text("CN", "a.example")?;
  let name = name.build();

  let mut builder = X509::builder()?;
  builder.set_version(2)?;
  builder.set_subject_name(&name)?;
  builder.set_issuer_name(&name)?;
  builder.set_pubkey(&key)?;
  builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
  builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
  builder.sign(&key, MessageDigest::sha256())?;
  Ok(builder.build().to_pem()?)
}

pub struct MockAcme {
  pub server: MockServer,
}

impl MockAcme {
  pub async fn start() -> Self {
    MockAcme {
      server: MockServer::start().await,
    }
  }

  pub fn uri(&self) -> String {
    self.server.uri()
  }

  pub fn url(&self, path: &str) -> String {
    format!("{}{}", self.server.uri(), path)
  }

  pub fn directory(&self, meta: Value) -> Value {
    json!({
      "newNonce": self.url("/new-nonce"),
      "newAccount": self.url("/new-account"),
      "newOrder": self.url("/new-order"),
      "revokeCert": self.url("/revoke-cert"),
      "keyChange": self.url("/key-change"),
      "meta": meta,
    })
  }

  pub async fn mount_directory(&self, meta: Value) {
    Mock::given(method("GET"))
      .and(path("/directory"))
      .respond_with(ResponseTemplate::new(200).set_body_json(self.directory(meta)))
      .mount(&self.server)
      .await;
  }

  pub async fn mount_nonces(&self) {
    Mock::given(method("HEAD"))
      .and(path("/new-nonce"))
      .respond_with(|_: &Request| acme_response(200))
      .mount(&self.server)
      .await;
  }

  pub fn account_created(&self) -> ResponseTemplate {
    acme_response(201)
      .insert_header("Location", self.url("/acct/1").as_str())
      .set_body_json(json!({ "status": "valid" }))
  }

  /// Directory, nonces and an account endpoint that accepts everything.
  pub async fn mount_basics(&self) {
    self.mount_directory(json!({})).await;
    self.mount_nonces().await;
    Mock::given(method("POST"))
      .and(path("/new-account"))
      .respond_with(self.account_created())
      .mount(&self.server)
      .await;
  }

  pub fn order(&self, id: u32, status: &str) -> Value {
    let mut order = json!({
      "status": status,
      "identifiers": [{ "type": "dns", "value": "a.example" }],
      "authorizations": [self.url(&format!("/authz/{}", id))],
      "finalize": self.url(&format!("/order/{}/finalize", id)),
    });
    if status == "valid" {
      order["certificate"] = json!(self.url(&format!("/cert/{}", id)));
    }
    order
  }

  pub fn order_created(&self, id: u32, status: &str) -> ResponseTemplate {
    acme_response(201)
      .insert_header("Location", self.url(&format!("/order/{}", id)).as_str())
      .set_body_json(self.order(id, status))
  }

  pub fn order_state(&self, id: u32, status: &str) -> ResponseTemplate {
    acme_response(200).set_body_json(self.order(id, status))
  }

  /// Requests received so far, in arrival order.
  pub async fn requests(&self, verb: &str, url_path: &str) -> Vec<Request> {
    self
      .server
      .received_requests()
      .await
      .unwrap_or_default()
      .into_iter()
      .filter(|req| req.method.as_str() == verb && req.url.path() == url_path)
      .collect()
  }

  pub async fn paths(&self) -> Vec<String> {
    self
      .server
      .received_requests()
      .await
      .unwrap_or_default()
      .into_iter()
      .map(|req| req.url.path().to_string())
      .collect()
  }
}
