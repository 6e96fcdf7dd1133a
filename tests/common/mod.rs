//! 測試用的最小 ACME 伺服器：不驗證 JWS 簽章，HTTP-01 驗證時真的連線到挑戰監聽器，
//! 並以一次性的 CA 簽發憑證。

use std::{
    convert::Infallible,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE, LOCATION},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    sha::sha256,
    x509::{
        extension::{BasicConstraints, SubjectAlternativeName},
        X509Builder, X509NameBuilder, X509Req, X509,
    },
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};

/// 取得一個目前未被使用的 port。
pub fn free_port() -> u16 {
    StdTcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[derive(Debug, Clone)]
struct StubOrder {
    domain: String,
    token: String,
    authz_valid: Option<bool>,
    certificate: Option<String>,
}

struct State {
    base: String,
    challenge_port: u16,
    ca_key: PKey<Private>,
    ca_cert: X509,
    thumbprint: Mutex<Option<String>>,
    orders: Mutex<Vec<StubOrder>>,
    nonces: AtomicUsize,
    validations: AtomicUsize,
}

pub struct StubAcme {
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl StubAcme {
    /// 啟動伺服器；HTTP-01 驗證會連到 `127.0.0.1:challenge_port`。
    pub async fn start(challenge_port: u16) -> StubAcme {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (ca_key, ca_cert) = make_ca();

        let state = Arc::new(State {
            base: format!("http://{addr}"),
            challenge_port,
            ca_key,
            ca_cert,
            thumbprint: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
            nonces: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
        });

        let serving = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = serving.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        StubAcme { state, task }
    }

    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.state.base)
    }

    /// 伺服器實際向挑戰監聽器發出的 HTTP-01 驗證次數。
    pub fn validations(&self) -> usize {
        self.state.validations.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> usize {
        self.state.orders.lock().len()
    }
}

impl Drop for StubAcme {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn make_ca() -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "stub acme ca").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

fn sign_csr(state: &State, csr_der: &[u8], domain: &str) -> String {
    let req = X509Req::from_der(csr_der).unwrap();
    let public_key = req.public_key().unwrap();
    assert!(req.verify(&public_key).unwrap());

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", domain).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder
        .set_issuer_name(state.ca_cert.subject_name())
        .unwrap();
    builder.set_pubkey(&public_key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(90).unwrap()).unwrap();
    let mut san = SubjectAlternativeName::new();
    san.dns(domain);
    let san = san
        .build(&builder.x509v3_context(Some(&*state.ca_cert), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&state.ca_key, MessageDigest::sha256()).unwrap();

    let leaf = builder.build();
    let mut pem = String::from_utf8(leaf.to_pem().unwrap()).unwrap();
    pem.push_str(&String::from_utf8(state.ca_cert.to_pem().unwrap()).unwrap());
    pem
}

fn decode_segment(segment: &str) -> Option<Value> {
    if segment.is_empty() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn jwk_thumbprint(jwk: &Value) -> String {
    let canonical = format!(
        r#"{{"e":"{}","kty":"{}","n":"{}"}}"#,
        jwk["e"].as_str().unwrap(),
        jwk["kty"].as_str().unwrap(),
        jwk["n"].as_str().unwrap()
    );
    URL_SAFE_NO_PAD.encode(sha256(canonical.as_bytes()))
}

fn respond(
    state: &State,
    status: StatusCode,
    body: Value,
    location: Option<String>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    let nonce = format!("nonce-{}", state.nonces.fetch_add(1, Ordering::SeqCst));
    let headers = response.headers_mut();
    headers.insert("replay-nonce", HeaderValue::from_str(&nonce).unwrap());
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(location) = location {
        headers.insert(LOCATION, HeaderValue::from_str(&location).unwrap());
    }
    response
}

fn order_json(state: &State, id: usize, order: &StubOrder) -> Value {
    let status = match (order.authz_valid, &order.certificate) {
        (_, Some(_)) => "valid",
        (Some(true), None) => "ready",
        (Some(false), _) => "invalid",
        (None, _) => "pending",
    };
    let mut body = json!({
        "status": status,
        "identifiers": [{"type": "dns", "value": order.domain}],
        "authorizations": [format!("{}/authz/{id}", state.base)],
        "finalize": format!("{}/finalize/{id}", state.base),
    });
    if order.certificate.is_some() {
        body["certificate"] = json!(format!("{}/cert/{id}", state.base));
    }
    body
}

fn authz_json(state: &State, id: usize, order: &StubOrder) -> Value {
    let (status, challenge_status) = match order.authz_valid {
        Some(true) => ("valid", "valid"),
        Some(false) => ("invalid", "invalid"),
        None => ("pending", "pending"),
    };
    let mut http = json!({
        "type": "http-01",
        "url": format!("{}/chall/{id}", state.base),
        "token": order.token,
        "status": challenge_status,
    });
    if order.authz_valid == Some(false) {
        http["error"] = json!({
            "type": "urn:ietf:params:acme:error:connection",
            "detail": "could not fetch challenge token"
        });
    }
    json!({
        "identifier": {"type": "dns", "value": order.domain},
        "status": status,
        "challenges": [
            {"type": "dns-01", "url": format!("{}/chall-dns/{id}", state.base), "token": order.token, "status": "pending"},
            http,
            {"type": "tls-alpn-01", "url": format!("{}/chall-alpn/{id}", state.base), "token": order.token, "status": "pending"},
        ],
    })
}

/// 向挑戰監聽器取得 token，回傳內容是否等於預期的 key authorization。
async fn validate_http01(state: &State, order: &StubOrder) -> bool {
    state.validations.fetch_add(1, Ordering::SeqCst);
    let expected = match state.thumbprint.lock().clone() {
        Some(thumbprint) => format!("{}.{}", order.token, thumbprint),
        None => return false,
    };
    let url = format!(
        "http://127.0.0.1:{}/.well-known/acme-challenge/{}",
        state.challenge_port, order.token
    );
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).header("Host", &order.domain).send().await {
        Ok(response) if response.status().is_success() => {
            response.text().await.map(|body| body == expected).unwrap_or(false)
        }
        _ => false,
    }
}

fn id_from(path: &str, prefix: &str) -> Option<usize> {
    path.strip_prefix(prefix)?.parse().ok()
}

async fn handle(state: Arc<State>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET && path == "/directory" {
        let base = &state.base;
        let body = json!({
            "newNonce": format!("{base}/new-nonce"),
            "newAccount": format!("{base}/new-account"),
            "newOrder": format!("{base}/new-order"),
            "meta": {"termsOfService": format!("{base}/terms")}
        });
        return respond(&state, StatusCode::OK, body, None);
    }
    if method == Method::HEAD && path == "/new-nonce" {
        return respond(&state, StatusCode::OK, Value::Null, None);
    }
    if method != Method::POST {
        return respond(&state, StatusCode::NOT_FOUND, json!({}), None);
    }

    let body = req.into_body().collect().await.unwrap().to_bytes();
    let jws: Value = serde_json::from_slice(&body).unwrap();
    let protected = decode_segment(jws["protected"].as_str().unwrap_or_default()).unwrap();
    let payload = decode_segment(jws["payload"].as_str().unwrap_or_default());
    assert_eq!(protected["alg"], "RS256");

    if path == "/new-account" {
        let thumbprint = jwk_thumbprint(&protected["jwk"]);
        *state.thumbprint.lock() = Some(thumbprint);
        let location = format!("{}/account/1", state.base);
        return respond(&state, StatusCode::CREATED, json!({"status": "valid"}), Some(location));
    }

    assert!(protected["kid"].is_string(), "request to {path} must use kid");

    if path == "/new-order" {
        let domain = payload.unwrap()["identifiers"][0]["value"]
            .as_str()
            .unwrap()
            .to_string();
        let mut orders = state.orders.lock();
        let id = orders.len();
        let order = StubOrder {
            domain,
            token: format!("token-{id}"),
            authz_valid: None,
            certificate: None,
        };
        let body = order_json(&state, id, &order);
        orders.push(order);
        let location = format!("{}/order/{id}", state.base);
        return respond(&state, StatusCode::CREATED, body, Some(location));
    }

    let lookup = |prefix: &str| {
        id_from(&path, prefix).and_then(|id| state.orders.lock().get(id).cloned().map(|o| (id, o)))
    };

    if let Some((id, order)) = lookup("/authz/") {
        return respond(&state, StatusCode::OK, authz_json(&state, id, &order), None);
    }
    if let Some((id, order)) = lookup("/order/") {
        return respond(&state, StatusCode::OK, order_json(&state, id, &order), None);
    }
    if let Some((id, order)) = lookup("/chall/") {
        let valid = validate_http01(&state, &order).await;
        let updated = {
            let mut orders = state.orders.lock();
            orders[id].authz_valid = Some(valid);
            orders[id].clone()
        };
        let authz = authz_json(&state, id, &updated);
        return respond(&state, StatusCode::OK, authz["challenges"][1].clone(), None);
    }
    if let Some((id, order)) = lookup("/finalize/") {
        let csr_b64 = payload.unwrap()["csr"].as_str().unwrap().to_string();
        let csr_der = URL_SAFE_NO_PAD.decode(csr_b64).unwrap();
        let pem = sign_csr(&state, &csr_der, &order.domain);
        let updated = {
            let mut orders = state.orders.lock();
            orders[id].certificate = Some(pem);
            orders[id].clone()
        };
        return respond(&state, StatusCode::OK, order_json(&state, id, &updated), None);
    }
    if let Some((_, order)) = lookup("/cert/") {
        let chain = Bytes::from(order.certificate.unwrap_or_default());
        let mut response = Response::new(Full::new(chain));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/pem-certificate-chain"),
        );
        return response;
    }

    let problem = json!({
        "type": "urn:ietf:params:acme:error:malformed",
        "detail": format!("unknown resource {path}")
    });
    respond(&state, StatusCode::NOT_FOUND, problem, None)
}
