//! HTTP API driven over a live server.

use std::fs;
use std::path::PathBuf;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use handout_desk::config::{load_config, Config};
use handout_desk::server::run_server;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct Server {
    tmp: TempDir,
    cfg: Config,
    base: String,
    client: Client,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn outbox(&self) -> PathBuf {
        self.tmp.path().join("outbox")
    }

    async fn db_value(&self, sql: &str, bind: &str) -> String {
        let pool = handout_desk::db::connect(&self.cfg).await.unwrap();
        let value: String = sqlx::query_scalar(sql)
            .bind(bind)
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;
        value
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = self.client.post(self.url(path)).json(&body);
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Register, verify through the stored token and log in.
    async fn signed_in(&self, username: &str) -> (String, String) {
        let (status, account) = self
            .post(
                "/accounts/register",
                None,
                json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": "long-enough",
                    "language": "en",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", account);
        let id = account["id"].as_str().unwrap().to_string();

        let token = self
            .db_value(
                "SELECT token FROM email_verification_tokens WHERE account_id = ?",
                &id,
            )
            .await;
        let (status, body) = self
            .post("/accounts/verify-email", None, json!({ "token": token }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "verified");

        let (status, session) = self
            .post(
                "/accounts/login",
                None,
                json!({ "username": username, "password": "long-enough" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        (id, session["token"].as_str().unwrap().to_string())
    }
}

async fn start_server() -> Server {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let config_path = tmp.path().join("hdk.toml");
    fs::write(
        &config_path,
        format!(
            r#"[db]
path = "{root}/hdk.sqlite"

[server]
bind = "127.0.0.1:{port}"

[auth]
secret = "api-test-secret"

[mail]
transport = "outbox"
outbox_dir = "{root}/outbox"
default_language = "en"

[export]
media_root = "{root}/media"
max_upload_bytes = 4096
"#,
            root = tmp.path().display(),
            port = port
        ),
    )
    .unwrap();

    let cfg = load_config(&config_path).unwrap();
    let cfg_clone = cfg.clone();
    tokio::spawn(async move {
        run_server(&cfg_clone).await.ok();
    });
    wait_for_server(port).await;

    Server {
        tmp,
        cfg,
        base: format!("http://127.0.0.1:{}", port),
        client: Client::new(),
    }
}

#[tokio::test]
async fn test_health() {
    let server = start_server().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_requires_authentication() {
    let server = start_server().await;
    let resp = server.client.get(server.url("/projects")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthenticated");

    let (status, body) = server.get("/projects", "not-a-session").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn test_register_verify_login_and_verification_mail() {
    let server = start_server().await;
    let (id, token) = server.signed_in("ana").await;

    let (status, me) = server.get("/accounts/me", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["account"]["id"], id.as_str());
    assert_eq!(me["account"]["tier"], "trial");
    assert_eq!(me["usage"]["usage"], 0);

    // the worker delivers the verification letter to the outbox
    let mut delivered = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let (_, letters) = server.get("/letters", &token).await;
        if letters
            .as_array()
            .map(|l| l.iter().any(|x| x["is_sent"] == true))
            .unwrap_or(false)
        {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "verification letter was not sent");
    let files: Vec<_> = fs::read_dir(server.outbox()).unwrap().collect();
    assert_eq!(files.len(), 1);
    let message: Value =
        serde_json::from_str(&fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap())
            .unwrap();
    assert_eq!(message["to"], "ana@example.com");
    assert!(message["html"]
        .as_str()
        .unwrap()
        .contains("/verify-email?token="));
}

#[tokio::test]
async fn test_wrong_password_is_permission_denied() {
    let server = start_server().await;
    server.signed_in("ben").await;
    let (status, body) = server
        .post(
            "/accounts/login",
            None,
            json!({ "username": "ben", "password": "wrong-password" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "permission_denied");
}

#[tokio::test]
async fn test_content_flow() {
    let server = start_server().await;
    let (_, token) = server.signed_in("cleo").await;

    let (status, project) = server
        .post("/projects", Some(&token), json!({ "name": "Biology" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_str().unwrap();

    let (status, handout) = server
        .post(
            "/handouts",
            Some(&token),
            json!({
                "project_id": project_id,
                "title": "Cells",
                "style": { "theme": "academic", "language": "en" },
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let handout_id = handout["id"].as_str().unwrap();

    let (status, top) = server
        .post(
            "/sections",
            Some(&token),
            json!({ "handout_id": handout_id, "title": "Membranes", "content": "Lipid bilayer." }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(top["level"], "section");
    assert_eq!(top["order"], 1);

    let (status, child) = server
        .post(
            "/sections",
            Some(&token),
            json!({
                "handout_id": handout_id,
                "parent_id": top["id"],
                "title": "Proteins",
                "content": "Channels.",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(child["level"], "subsection");

    let (status, bad) = server
        .post(
            "/sections",
            Some(&token),
            json!({ "handout_id": handout_id, "title": "", "content": "x" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(bad["error"]["code"], "validation_error");

    let (status, detail) = server.get(&format!("/handouts/{}", handout_id), &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["sections"][0]["children"][0]["title"], "Proteins");

    let (status, outline) = server
        .get(&format!("/sections?handout={}", handout_id), &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outline.as_array().unwrap().len(), 2);

    let (status, body) = server.get("/sections", &token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let resp = server
        .client
        .get(server.url(&format!("/handouts/{}/export-pdf", handout_id)))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/pdf");
    let pdf = resp.bytes().await.unwrap();
    assert!(pdf.starts_with(b"%PDF"));

    let (_, me) = server.get("/accounts/me", &token).await;
    let expected = pdf.len() as u64 + "Lipid bilayer.".len() as u64 + "Channels.".len() as u64;
    assert_eq!(me["usage"]["usage"], expected);

    let resp = server
        .client
        .get(server.url(&format!("/projects/{}/download-zip", project_id)))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/zip");
    let zip = resp.bytes().await.unwrap();
    assert!(zip.starts_with(b"PK"));

    // another account sees nothing of it
    let (_, other) = server.signed_in("dora").await;
    let (status, body) = server.get(&format!("/handouts/{}", handout_id), &other).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "permission_denied");

    let resp = server
        .client
        .delete(server.url(&format!("/handouts/{}", handout_id)))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let (status, body) = server.get(&format!("/handouts/{}", handout_id), &token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_empty_project_zip_is_validation_error() {
    let server = start_server().await;
    let (_, token) = server.signed_in("eli").await;
    let (_, project) = server
        .post("/projects", Some(&token), json!({ "name": "Empty" }))
        .await;
    let (status, body) = server
        .get(
            &format!("/projects/{}/download-zip", project["id"].as_str().unwrap()),
            &token,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_reorder_rejects_bad_batch() {
    let server = start_server().await;
    let (_, token) = server.signed_in("finn").await;
    let (_, project) = server
        .post("/projects", Some(&token), json!({ "name": "Maths" }))
        .await;
    let (_, handout) = server
        .post(
            "/handouts",
            Some(&token),
            json!({ "project_id": project["id"], "title": "Algebra" }),
        )
        .await;
    let handout_id = handout["id"].as_str().unwrap();
    let mut ids = Vec::new();
    for title in ["One", "Two"] {
        let (_, s) = server
            .post(
                "/sections",
                Some(&token),
                json!({ "handout_id": handout_id, "title": title }),
            )
            .await;
        ids.push(s["id"].as_str().unwrap().to_string());
    }

    let (status, body) = server
        .post(
            &format!("/handouts/{}/reorder-sections", handout_id),
            Some(&token),
            json!({ "sections": [
                { "id": ids[0], "order": 2 },
                { "id": ids[1], "order": 2 },
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, outline) = server
        .post(
            &format!("/handouts/{}/reorder-sections", handout_id),
            Some(&token),
            json!({ "sections": [
                { "id": ids[0], "order": 2 },
                { "id": ids[1], "order": 1 },
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outline[0]["id"], ids[1].as_str());
    assert_eq!(outline[1]["id"], ids[0].as_str());
}

#[tokio::test]
async fn test_template_upsert_is_admin_only() {
    let server = start_server().await;
    let (_, token) = server.signed_in("gus").await;
    let resp = server
        .client
        .put(server.url("/email-templates"))
        .bearer_auth(&token)
        .json(&json!({
            "name": "email_verification",
            "language": "th",
            "subject": "ยืนยัน",
            "html_content": "<p>{{ username }}</p>",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_password_reset_unknown_email() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/accounts/password-reset",
            None,
            json!({ "email": "ghost@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_attachment_upload_over_http() {
    let server = start_server().await;
    let (_, token) = server.signed_in("ada").await;

    let resp = server
        .client
        .post(server.url("/attachments?file_name=cell%20diagram.png&caption=Cell"))
        .bearer_auth(&token)
        .header("Content-Type", "image/png")
        .body(vec![7u8; 512])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let uploaded: Value = resp.json().await.unwrap();
    assert_eq!(uploaded["file_name"], "cell diagram.png");
    assert_eq!(uploaded["mime_type"], "image/png");
    assert_eq!(uploaded["file_size"], 512);
    assert!(uploaded["file_url"]
        .as_str()
        .unwrap()
        .ends_with("-cell%20diagram.png"));

    let (status, listed) = server.get("/attachments", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let resp = server
        .client
        .post(server.url("/attachments?file_name=huge.bin"))
        .bearer_auth(&token)
        .body(vec![0u8; 8192])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let (_, other) = server.signed_in("bea").await;
    let path = format!("/attachments/{}", uploaded["id"].as_str().unwrap());
    let (status, body) = server.get(&path, &other).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "permission_denied");
}
