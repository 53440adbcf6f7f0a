use crate::common::input::FixedExchange;
use crate::common::input::ScriptedInput;
use crate::common::mock_acme::*;
use crate::common::test_env::TestEnv;
use acme2_lifecycle::*;
use openssl::x509::X509Req;
use openssl::x509::X509;
use serde_json::json;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::Request;
use wiremock::ResponseTemplate;


fn order_request() -> OrderRequest {
  OrderRequest::new(
    vec![Identifier::dns("a.example")],
    Arc::new(AutomaticCsr::new(KeyType::Es256)),
  )
}

async fn ready_client(acme: &MockAcme, env: &TestEnv) -> AcmeClient {
  acme.mount_basics().await;
  env.client(env.settings(acme)).await.unwrap()
}

#[tokio::test]
async fn test_directory_falls_back_to_base_uri_once() {
  let acme = MockAcme::start().await;
  Mock::given(method("GET"))
    .and(path("/acme/directory"))
    .respond_with(ResponseTemplate::new(404))
    .expect(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("GET"))
    .and(path("/acme"))
    .respond_with(ResponseTemplate::new(200).set_body_json(acme.directory(json!({}))))
    .expect(1)
    .mount(&acme.server)
    .await;

  let dir = DirectoryBuilder::new(acme.url("/acme")).build().await.unwrap();
  assert_eq!(dir.new_order_url, acme.url("/new-order"));
  assert!(!dir.external_account_required());
}

#[tokio::test]
async fn test_bootstrap_fails_when_both_directory_locations_fail() {
  let acme = MockAcme::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(503))
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.base_uri = acme.url("/acme");
  let result = env.client(settings).await;
  assert!(result.is_err());

  assert_eq!(acme.requests("GET", "/acme/directory").await.len(), 1);
  assert_eq!(acme.requests("GET", "/acme").await.len(), 1);
  assert!(acme.requests("POST", "/new-account").await.is_empty());
}

#[tokio::test]
async fn test_account_is_created_then_loaded() {
  let acme = MockAcme::start().await;
  acme.mount_directory(json!({})).await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(acme.account_created())
    .expect(1)
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.contacts = vec!["ops@example.com".to_string(), "not an address".to_string()];
  let client = env.client(settings.clone()).await.unwrap();
  let account = client.account().await.unwrap();
  assert_eq!(account.id(), acme.url("/acct/1"));

  let requests = acme.requests("POST", "/new-account").await;
  let header = jws_header(&requests[0]);
  assert_eq!(header["alg"], "ES256");
  assert!(header["jwk"].is_object());
  let payload = jws_payload(&requests[0]);
  assert_eq!(payload["contact"], json!(["mailto:ops@example.com"]));
  assert_eq!(payload["termsOfServiceAgreed"], json!(true));
  assert!(env.config_path().join("signer.json").exists());
  assert!(env.config_path().join("account.json").exists());

  let again = env.client(settings).await.unwrap();
  let reloaded = again.account().await.unwrap();
  assert_eq!(reloaded.id(), account.id());
  assert_eq!(
    reloaded.signer.signing_tool().unwrap().jwk(),
    account.signer.signing_tool().unwrap().jwk()
  );
}

#[tokio::test]
async fn test_rejected_algorithm_falls_back_once() {
  let acme = MockAcme::start().await;
  acme.mount_directory(json!({})).await;
  acme.mount_nonces().await;
  let created = acme.account_created();
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(move |req: &Request| {
      if jws_header(req)["alg"] == "ES256" {
        problem(400, "badSignatureAlgorithm")
      } else {
        created.clone()
      }
    })
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let client = env.client(env.settings(&acme)).await.unwrap();

  let algs: Vec<String> = acme
    .requests("POST", "/new-account")
    .await
    .iter()
    .map(|req| jws_header(req)["alg"].as_str().unwrap().to_string())
    .collect();
  assert_eq!(algs, vec!["ES256", "RS256"]);
  let account = client.account().await.unwrap();
  assert_eq!(account.signer.key_type().unwrap(), KeyType::Rs256);
}

#[tokio::test]
async fn test_second_algorithm_rejection_is_fatal() {
  let acme = MockAcme::start().await;
  acme.mount_directory(json!({})).await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(problem(400, "badSignatureAlgorithm"))
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let err = env.client(env.settings(&acme)).await.err().unwrap();
  assert_eq!(err.problem_kind(), Some(ProblemKind::BadSignatureAlgorithm));
  assert_eq!(acme.requests("POST", "/new-account").await.len(), 2);
  assert!(!env.config_path().join("account.json").exists());
}

#[tokio::test]
async fn test_bad_nonce_is_retried_with_a_fresh_nonce() {
  let acme = MockAcme::start().await;
  acme.mount_directory(json!({})).await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(problem(400, "badNonce"))
    .up_to_n_times(2)
    .with_priority(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(acme.account_created())
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  env.client(env.settings(&acme)).await.unwrap();

  assert_eq!(acme.requests("POST", "/new-account").await.len(), 3);
  assert_eq!(acme.requests("HEAD", "/new-nonce").await.len(), 3);
  assert_eq!(
    acme.paths().await[1..],
    [
      "/new-nonce",
      "/new-account",
      "/new-nonce",
      "/new-account",
      "/new-nonce",
      "/new-account"
    ]
  );
}

#[tokio::test]
async fn test_bad_nonce_gives_up_after_three_attempts() {
  let acme = MockAcme::start().await;
  acme.mount_directory(json!({})).await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(problem(400, "badNonce"))
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let err = env.client(env.settings(&acme)).await.err().unwrap();
  assert_eq!(err.problem_kind(), Some(ProblemKind::BadNonce));
  assert_eq!(acme.requests("POST", "/new-account").await.len(), 3);
}

#[tokio::test]
async fn test_unattended_run_requires_accepted_terms() {
  let acme = MockAcme::start().await;
  acme
    .mount_directory(json!({ "termsOfService": acme.url("/terms.pdf") }))
    .await;
  acme.mount_nonces().await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.terms_of_service_agreed = false;
  let err = env.client(settings).await.err().unwrap();
  assert!(matches!(err, Error::TermsNotAccepted));
  assert!(acme.requests("POST", "/new-account").await.is_empty());
}

#[tokio::test]
async fn test_interactive_setup_with_terms_and_eab() {
  let acme = MockAcme::start().await;
  acme
    .mount_directory(json!({
      "termsOfService": acme.url("/terms.pdf"),
      "externalAccountRequired": true,
    }))
    .await;
  acme.mount_nonces().await;
  Mock::given(method("GET"))
    .and(path("/terms.pdf"))
    .respond_with(ResponseTemplate::new(200).set_body_string("terms"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(acme.account_created())
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.terms_of_service_agreed = false;
  settings.contacts = vec![];
  let input = Arc::new(ScriptedInput {
    agree: true,
    key_identifier: "kid-1".to_string(),
    key: Some("c2VjcmV0LWtleS1mb3ItdGVzdHM".to_string()),
    contacts: "ops@example.com, nope".to_string(),
    ..Default::default()
  });
  env
    .interactive_client(settings, input.clone())
    .await
    .unwrap();

  let terms = std::fs::read_to_string(env.config_path().join("terms.pdf")).unwrap();
  assert_eq!(terms, "terms");
  assert!(input.asked().iter().any(|q| q.contains("terms.pdf")));

  let requests = acme.requests("POST", "/new-account").await;
  let payload = jws_payload(&requests[0]);
  assert_eq!(payload["termsOfServiceAgreed"], json!(true));
  assert_eq!(payload["contact"], json!(["mailto:ops@example.com"]));
  let binding = &payload["externalAccountBinding"];
  let protected: serde_json::Value =
    serde_json::from_slice(&decode(binding["protected"].as_str().unwrap())).unwrap();
  assert_eq!(protected["kid"], "kid-1");
  assert_eq!(protected["alg"], "HS256");
  assert_eq!(protected["url"], acme.url("/new-account"));
}

#[tokio::test]
async fn test_declined_terms_create_no_account() {
  let acme = MockAcme::start().await;
  acme
    .mount_directory(json!({ "termsOfService": acme.url("/terms.pdf") }))
    .await;
  acme.mount_nonces().await;
  Mock::given(method("GET"))
    .and(path("/terms.pdf"))
    .respond_with(ResponseTemplate::new(404))
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.terms_of_service_agreed = false;
  let input = Arc::new(ScriptedInput::default());
  let err = env.interactive_client(settings, input.clone()).await.err().unwrap();
  assert!(matches!(err, Error::TermsNotAccepted));
  assert!(input.asked()[0].contains(&acme.url("/terms.pdf")));
  assert!(acme.requests("POST", "/new-account").await.is_empty());
}

#[tokio::test]
async fn test_eab_exchange_supplies_contact() {
  let acme = MockAcme::start().await;
  acme
    .mount_directory(json!({ "externalAccountRequired": true }))
    .await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(acme.account_created())
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.contacts = vec![];
  let input = Arc::new(ScriptedInput {
    menu_choice: Some(1),
    ..Default::default()
  });
  let exchange = Arc::new(FixedExchange {
    credentials: EabCredentials {
      key_identifier: "kid-from-api".to_string(),
      key: "c2VjcmV0LWtleS1mb3ItdGVzdHM".to_string(),
      algorithm: "HS384".to_string(),
      contact: Some("billing@example.com".to_string()),
    },
  });
  AcmeClientBuilder::new(settings)
    .http_client(reqwest::Client::new())
    .input(input.clone())
    .eab_exchange(exchange)
    .build()
    .await
    .unwrap();

  let payload = jws_payload(&acme.requests("POST", "/new-account").await[0]);
  assert_eq!(payload["contact"], json!(["mailto:billing@example.com"]));
  assert!(!input.asked().iter().any(|q| q.starts_with("Email")));
}

#[tokio::test]
async fn test_configured_eab_is_sent_even_when_not_required() {
  let acme = MockAcme::start().await;
  acme.mount_basics().await;

  let env = TestEnv::new();
  let mut settings = env.settings(&acme);
  settings.eab = Some(EabCredentials {
    key_identifier: "kid-configured".to_string(),
    key: "c2VjcmV0LWtleS1mb3ItdGVzdHM".to_string(),
    algorithm: "HS256".to_string(),
    contact: None,
  });
  env.client(settings).await.unwrap();

  let payload = jws_payload(&acme.requests("POST", "/new-account").await[0]);
  let binding = &payload["externalAccountBinding"];
  let protected: serde_json::Value =
    serde_json::from_slice(&decode(binding["protected"].as_str().unwrap())).unwrap();
  assert_eq!(protected["kid"], "kid-configured");
  assert_eq!(payload["contact"], json!(["mailto:ops@example.com"]));
}

#[tokio::test]
async fn test_unresolved_eab_skips_contacts_when_unattended() {
  let acme = MockAcme::start().await;
  acme
    .mount_directory(json!({ "externalAccountRequired": true }))
    .await;
  acme.mount_nonces().await;
  Mock::given(method("POST"))
    .and(path("/new-account"))
    .respond_with(acme.account_created())
    .mount(&acme.server)
    .await;

  let env = TestEnv::new();
  env.client(env.settings(&acme)).await.unwrap();

  let payload = jws_payload(&acme.requests("POST", "/new-account").await[0]);
  assert_eq!(payload["contact"], json!([]));
  assert!(payload.get("externalAccountBinding").is_none());
}

#[tokio::test]
async fn test_cached_order_is_reused_while_ready() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "ready"))
    .expect(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(acme.order_state(1, "ready"))
    .mount(&acme.server)
    .await;

  let first = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert!(!first.reused);
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache
    .save_key(&first.cache_key, &gen_ec_p256_private_key().unwrap())
    .await
    .unwrap();

  let second = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert!(second.reused);
  assert_eq!(second.details.url, first.details.url);
  assert_eq!(second.key_file, cache.key_file(&first.cache_key));
}

#[tokio::test]
async fn test_invalid_cached_order_is_replaced() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "ready"))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(2, "pending"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(acme.order_state(1, "invalid"))
    .mount(&acme.server)
    .await;

  let first = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache
    .save_key(&first.cache_key, &gen_ec_p256_private_key().unwrap())
    .await
    .unwrap();

  let second = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert_eq!(second.details.url, acme.url("/order/2"));
  assert!(!second.reused);
  assert_eq!(second.cache_key, first.cache_key);
  assert!(!cache.key_file(&first.cache_key).exists());
  assert_eq!(acme.requests("POST", "/order/1").await.len(), 1);
}

#[tokio::test]
async fn test_failed_refresh_discards_cached_order() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "ready"))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(2, "pending"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(problem(500, "serverInternal"))
    .mount(&acme.server)
    .await;

  let first = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache
    .save_key(&first.cache_key, &gen_ec_p256_private_key().unwrap())
    .await
    .unwrap();

  let second = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert_eq!(second.details.url, acme.url("/order/2"));
  assert!(!second.reused);
  assert!(!cache.key_file(&first.cache_key).exists());
  let saved = std::fs::read_to_string(cache.order_file(&first.cache_key)).unwrap();
  assert!(saved.contains("/order/2"));
  assert_eq!(acme.requests("POST", "/order/1").await.len(), 1);
}

#[tokio::test]
async fn test_expired_cache_entry_is_never_returned() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "valid"))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(2, "pending"))
    .mount(&acme.server)
    .await;

  let first = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache
    .save_key(&first.cache_key, &gen_ec_p256_private_key().unwrap())
    .await
    .unwrap();
  File::options()
    .write(true)
    .open(cache.order_file(&first.cache_key))
    .unwrap()
    .set_modified(SystemTime::now() - Duration::from_secs(2 * 86_400))
    .unwrap();

  let second = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert_eq!(second.details.url, acme.url("/order/2"));
  assert!(acme.requests("POST", "/order/1").await.is_empty());
}

#[tokio::test]
async fn test_rejected_order_returns_none() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  let mut rejected = acme.order(1, "invalid");
  rejected["error"] = json!({
    "type": "urn:ietf:params:acme:error:rejectedIdentifier",
    "detail": "a.example is not allowed",
  });
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(
      acme_response(201)
        .insert_header("Location", acme.url("/order/1").as_str())
        .set_body_json(rejected),
    )
    .mount(&acme.server)
    .await;

  let order = client.get_or_create_order(&order_request()).await.unwrap();
  assert!(order.is_none());
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  let key = fingerprint(
    &acme.url("/acct/1"),
    "a.example",
    &[Identifier::dns("a.example")],
    "automatic-ES256",
    None,
  )
  .unwrap();
  assert!(!cache.order_file(&key).exists());
}

#[tokio::test]
async fn test_finalize_waits_for_ready_and_processing() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "pending"))
    .mount(&acme.server)
    .await;
  for (priority, status, times) in [(1, "pending", 2), (2, "ready", 1), (3, "processing", 1)] {
    Mock::given(method("POST"))
      .and(path("/order/1"))
      .respond_with(acme.order_state(1, status))
      .up_to_n_times(times)
      .with_priority(priority)
      .mount(&acme.server)
      .await;
  }
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(acme.order_state(1, "valid"))
    .with_priority(4)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1/finalize"))
    .respond_with(acme.order_state(1, "processing"))
    .expect(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/cert/1"))
    .respond_with(acme_response(200).set_body_bytes(self_signed_pem().unwrap()))
    .mount(&acme.server)
    .await;

  let order = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let csr = AutomaticCsr::new(KeyType::Es256);
  let finalized = client.finalize_order(&order, &csr).await.unwrap();
  assert_eq!(finalized.details.status(), OrderStatus::Valid);

  let order_paths: Vec<String> = acme
    .paths()
    .await
    .into_iter()
    .filter(|p| p.starts_with("/order/1"))
    .collect();
  assert_eq!(
    order_paths,
    [
      "/order/1",
      "/order/1",
      "/order/1",
      "/order/1/finalize",
      "/order/1",
      "/order/1"
    ]
  );

  let finalize = &acme.requests("POST", "/order/1/finalize").await[0];
  let csr_der = decode(jws_payload(finalize)["csr"].as_str().unwrap());
  let req = X509Req::from_der(&csr_der).unwrap();
  assert!(req.verify(&finalized.private_key).unwrap());

  let chain = client.download_certificate(&finalized.details).await.unwrap();
  assert_eq!(chain.len(), 1);
  let download = &acme.requests("POST", "/cert/1").await[0];
  assert_eq!(
    download.headers.get("accept").unwrap().to_str().unwrap(),
    "application/pem-certificate-chain"
  );
}

#[tokio::test]
async fn test_order_that_stays_pending_is_not_finalized() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  acme.mount_basics().await;
  let mut settings = env.settings(&acme);
  settings.retry_count = 2;
  let client = env.client(settings).await.unwrap();
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "pending"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(acme.order_state(1, "pending"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1/finalize"))
    .respond_with(acme.order_state(1, "processing"))
    .expect(0)
    .mount(&acme.server)
    .await;

  let order = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let finalized = client
    .finalize_order(&order, &AutomaticCsr::new(KeyType::Es256))
    .await
    .unwrap();
  assert_eq!(finalized.details.status(), OrderStatus::Pending);
  assert_eq!(acme.requests("POST", "/order/1").await.len(), 2);
}

async fn mount_ready_order(acme: &MockAcme) {
  Mock::given(method("POST"))
    .and(path("/new-order"))
    .respond_with(acme.order_created(1, "ready"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1/finalize"))
    .respond_with(acme.order_state(1, "valid"))
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(acme.order_state(1, "valid"))
    .mount(&acme.server)
    .await;
}

#[tokio::test]
async fn test_leftover_key_is_ignored_when_reuse_is_disabled() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  acme.mount_basics().await;
  mount_ready_order(&acme).await;
  let mut settings = env.settings(&acme);
  settings.cache.reuse_days = 0;
  let client = env.client(settings).await.unwrap();

  let order = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  let leftover = gen_ec_p256_private_key().unwrap();
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache.save_key(&order.cache_key, &leftover).await.unwrap();

  let finalized = client
    .finalize_order(&order, &AutomaticCsr::new(KeyType::Es256))
    .await
    .unwrap();
  assert!(!finalized.private_key.public_eq(&leftover));
  assert!(cache.load_key(&order.cache_key).await.unwrap().public_eq(&leftover));
}

#[tokio::test]
async fn test_new_order_replaces_leftover_key() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  mount_ready_order(&acme).await;

  let order = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert!(!order.reused);
  let leftover = gen_ec_p256_private_key().unwrap();
  let cache = OrderCache::new(env.config_path().join("orders"), 1, Protector::plain());
  cache.save_key(&order.cache_key, &leftover).await.unwrap();

  let csr = AutomaticCsr::new(KeyType::Es256);
  let finalized = client.finalize_order(&order, &csr).await.unwrap();
  assert!(!finalized.private_key.public_eq(&leftover));
  let cached = cache.load_key(&order.cache_key).await.unwrap();
  assert!(cached.public_eq(&finalized.private_key));

  let again = client.get_or_create_order(&order_request()).await.unwrap().unwrap();
  assert!(again.reused);
  let refinalized = client.finalize_order(&again, &csr).await.unwrap();
  assert!(refinalized.private_key.public_eq(&finalized.private_key));
}

#[tokio::test]
async fn test_concurrent_calls_share_the_nonce_chain() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  let order = acme.order(1, "ready");
  Mock::given(method("POST"))
    .and(path("/order/1"))
    .respond_with(move |_: &Request| acme_response(200).set_body_json(order.clone()))
    .mount(&acme.server)
    .await;

  let url = acme.url("/order/1");
  let session = client.session();
  let results =
    futures_util::future::join_all((0..5).map(|_| session.get_order(&url))).await;
  assert!(results.iter().all(|r| r.is_ok()));

  assert_eq!(acme.requests("HEAD", "/new-nonce").await.len(), 1);
  let mut nonces: Vec<String> = acme
    .requests("POST", "/order/1")
    .await
    .iter()
    .map(|req| jws_header(req)["nonce"].as_str().unwrap().to_string())
    .collect();
  nonces.sort();
  nonces.dedup();
  assert_eq!(nonces.len(), 5);
}

#[tokio::test]
async fn test_answer_challenge_polls_until_valid() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  let challenge = |status: &str| {
    json!({
      "type": "http-01",
      "url": acme.url("/chall/1"),
      "status": status,
      "token": "tok",
    })
  };
  Mock::given(method("POST"))
    .and(path("/chall/1"))
    .respond_with(acme_response(200).set_body_json(challenge("processing")))
    .up_to_n_times(2)
    .with_priority(1)
    .mount(&acme.server)
    .await;
  Mock::given(method("POST"))
    .and(path("/chall/1"))
    .respond_with(acme_response(200).set_body_json(challenge("valid")))
    .mount(&acme.server)
    .await;

  let pending: Challenge = serde_json::from_value(challenge("pending")).unwrap();
  let answered = client.answer_challenge(&pending).await.unwrap();
  assert_eq!(answered.status, ChallengeStatus::Valid);

  let requests = acme.requests("POST", "/chall/1").await;
  assert_eq!(requests.len(), 3);
  assert_eq!(jws_payload_raw(&requests[0]), "{}");
  assert_eq!(jws_payload_raw(&requests[1]), "");

  let account = client.account().await.unwrap();
  let key_authorization = account.key_authorization("tok").unwrap();
  assert!(key_authorization.starts_with("tok."));
}

#[tokio::test]
async fn test_change_contacts_persists_account() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/acct/1"))
    .respond_with(acme_response(200).set_body_json(json!({
      "status": "valid",
      "contact": ["mailto:new@example.com"],
    })))
    .mount(&acme.server)
    .await;

  client
    .change_contacts(&["new@example.com".to_string(), "bad".to_string()])
    .await
    .unwrap();

  let request = &acme.requests("POST", "/acct/1").await[0];
  assert_eq!(jws_header(request)["kid"], acme.url("/acct/1"));
  assert_eq!(jws_payload(request)["contact"], json!(["mailto:new@example.com"]));

  let stored = std::fs::read_to_string(env.config_path().join("account.json")).unwrap();
  assert!(stored.contains("mailto:new@example.com"));
  assert_eq!(
    client.account().await.unwrap().details.contact,
    Some(vec!["mailto:new@example.com".to_string()])
  );
}

#[tokio::test]
async fn test_revoke_certificate_sends_reason() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  Mock::given(method("POST"))
    .and(path("/revoke-cert"))
    .respond_with(acme_response(200))
    .expect(1)
    .mount(&acme.server)
    .await;

  let cert = X509::from_pem(&self_signed_pem().unwrap()).unwrap();
  client.revoke_certificate(&cert, Some(4)).await.unwrap();

  let payload = jws_payload(&acme.requests("POST", "/revoke-cert").await[0]);
  assert_eq!(payload["reason"], json!(4));
  assert_eq!(decode(payload["certificate"].as_str().unwrap()), cert.to_der().unwrap());
}

#[tokio::test]
async fn test_reencrypt_secrets_seals_signer() {
  let acme = MockAcme::start().await;
  let env = TestEnv::new();
  let client = ready_client(&acme, &env).await;
  client.reencrypt_secrets().await.unwrap();
  let plain = std::fs::read_to_string(env.config_path().join("signer.json")).unwrap();
  assert!(!plain.starts_with("enc:v1:"));

  let mut settings = env.settings(&acme);
  settings.encrypt_secrets = true;
  let sealing = env.client(settings.clone()).await.unwrap();
  sealing.reencrypt_secrets().await.unwrap();
  let sealed = std::fs::read_to_string(env.config_path().join("signer.json")).unwrap();
  assert!(sealed.starts_with("enc:v1:"));
  assert!(env.config_path().join("machine.key").exists());

  let reopened = env.client(settings).await.unwrap();
  assert_eq!(
    reopened.account().await.unwrap().id(),
    client.account().await.unwrap().id()
  );
  assert_eq!(acme.requests("POST", "/new-account").await.len(), 1);
}
