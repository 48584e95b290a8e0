//! Reconciler scenarios against a mock platform

use serde_json::json;
use std::io::Write;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cfweave_client::{AuthScheme, CancelToken, CfClient, ClientConfig};
use cfweave_provider::{ReadOutcome, Session};

fn session_for(server: &MockServer) -> Session {
    let config = ClientConfig {
        api_url: Url::parse(&server.uri()).unwrap(),
        auth: AuthScheme::Token {
            access_token: "test-token".to_string(),
            refresh_token: None,
        },
        skip_ssl_validation: false,
        user_agent: "Terraform/1.9.0 cloudfoundry/0.3.0".to_string(),
        app_log_trace: false,
    };
    let client = CfClient::new(&config).unwrap();
    Session::new(client, &config)
}

fn org_body(guid: &str, name: &str) -> serde_json::Value {
    json!({
        "guid": guid,
        "name": name,
        "suspended": false,
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
        "metadata": { "labels": {}, "annotations": {} }
    })
}

// ---------------------------------------------------------------------------
// Generic reconciler properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_gone_removes_record_without_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/organizations/org-gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errors": [{"code": 10010, "title": "CF-ResourceNotFound", "detail": "gone"}]
        })))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_org").unwrap();
    let output = reconciler
        .read(&session, json!({ "id": "org-gone" }), &CancelToken::never())
        .await;
    assert!(matches!(output.outcome, ReadOutcome::Gone));
    assert!(!output.diagnostics.has_errors());
}

#[tokio::test]
async fn delete_is_idempotent_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v3/organizations/org-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errors": [{"code": 10010, "title": "CF-ResourceNotFound", "detail": "gone"}]
        })))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_org").unwrap();
    let diagnostics = reconciler
        .delete(&session, json!({ "id": "org-1", "name": "x" }), &CancelToken::never())
        .await;
    assert!(!diagnostics.has_errors());
}

#[tokio::test]
async fn identity_is_stable_across_reads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/organizations/org-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(org_body("org-1", "prod")))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_org").unwrap();
    let mut tuples = Vec::new();
    for _ in 0..3 {
        let output = reconciler
            .read(&session, json!({ "id": "org-1" }), &CancelToken::never())
            .await;
        let identity = output.identity.expect("identity on every read");
        tuples.push(serde_json::to_vec(&identity.to_tuple()).unwrap());
    }
    assert_eq!(tuples[0], tuples[1]);
    assert_eq!(tuples[1], tuples[2]);
}

#[tokio::test]
async fn create_read_round_trip_preserves_user_attributes() {
    let server = MockServer::start().await;
    let body = json!({
        "guid": "org-7",
        "name": "round-trip",
        "suspended": true,
        "created_at": "2026-03-01T00:00:00Z",
        "updated_at": "2026-03-01T00:00:00Z",
        "metadata": { "labels": { "env": "qa" }, "annotations": {} }
    });
    Mock::given(method("POST"))
        .and(path("/v3/organizations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/organizations/org-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_org").unwrap();
    let desired = json!({
        "name": "round-trip",
        "suspended": true,
        "labels": { "env": "qa" }
    });
    let created = reconciler
        .create(&session, desired.clone(), &CancelToken::never())
        .await;
    assert!(!created.diagnostics.has_errors());
    let record = created.record.unwrap();

    let read = reconciler
        .read(&session, record, &CancelToken::never())
        .await;
    let ReadOutcome::Live(refreshed) = read.outcome else {
        panic!("expected live record");
    };
    assert_eq!(refreshed["name"], desired["name"]);
    assert_eq!(refreshed["suspended"], desired["suspended"]);
    assert_eq!(refreshed["labels"], desired["labels"]);
}

// ---------------------------------------------------------------------------
// S4: org quota unassignment refusal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn org_quota_update_refuses_unassignment() {
    // No platform mocks on purpose: any request would fail the test with
    // a connection diagnostic instead of the expected refusal.
    let server = MockServer::start().await;
    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_org_quota").unwrap();

    let prior = json!({
        "id": "q-1",
        "name": "runtime",
        "orgs": ["org-o1", "org-o2"]
    });
    let plan = json!({
        "id": "q-1",
        "name": "runtime",
        "orgs": ["org-o1"]
    });
    let output = reconciler
        .update(&session, plan, prior, &CancelToken::never())
        .await;
    assert!(output.diagnostics.has_errors());
    let rendered = output.diagnostics.error_summary();
    assert!(rendered.contains("org-o2"), "diagnostic must name the org: {rendered}");
    assert!(rendered.contains("unassign"));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

// ---------------------------------------------------------------------------
// S3: shared instance partial failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sharing_partial_failure_reports_actual_membership() {
    let server = MockServer::start().await;
    // Unshare A succeeds.
    Mock::given(method("DELETE"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces/space-a"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    // Share C fails.
    Mock::given(method("POST"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({
            "errors": [{"code": 10001, "title": "CF-ShareFailed", "detail": "broker down"}]
        })))
        .mount(&server)
        .await;
    // Read-back shows exactly [B].
    Mock::given(method("GET"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"guid": "space-b"}]
        })))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler =
        cfweave_provider::reconciler_for("cloudfoundry_service_instance_sharing").unwrap();
    let prior = json!({
        "id": "si-1",
        "service_instance": "si-1",
        "spaces": ["space-a", "space-b"]
    });
    let plan = json!({
        "id": "si-1",
        "service_instance": "si-1",
        "spaces": ["space-b", "space-c"]
    });
    let output = reconciler
        .update(&session, plan, prior, &CancelToken::never())
        .await;

    assert!(output.diagnostics.has_errors());
    let record = output.record.expect("state must reflect what happened");
    assert_eq!(record["spaces"], json!(["space-b"]));
}

#[tokio::test]
async fn sharing_update_issues_one_unshare_and_one_share() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces/space-a"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces"))
        .and(body_string_contains("space-c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"guid": "space-b"}, {"guid": "space-c"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/service_instances/si-1/relationships/shared_spaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"guid": "space-b"}, {"guid": "space-c"}]
        })))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler =
        cfweave_provider::reconciler_for("cloudfoundry_service_instance_sharing").unwrap();
    let prior = json!({ "id": "si-1", "service_instance": "si-1", "spaces": ["space-a", "space-b"] });
    let plan = json!({ "id": "si-1", "service_instance": "si-1", "spaces": ["space-b", "space-c"] });
    let output = reconciler
        .update(&session, plan, prior, &CancelToken::never())
        .await;
    assert!(!output.diagnostics.has_errors());
    assert_eq!(output.record.unwrap()["spaces"], json!(["space-b", "space-c"]));
}

// ---------------------------------------------------------------------------
// S6: binding credential sub-fetch downgrade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn binding_subfetch_failure_downgrades_to_warning() {
    let server = MockServer::start().await;
    let binding_body = json!({
        "guid": "bind-1",
        "type": "key",
        "name": "my-key",
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
        "relationships": { "service_instance": { "data": { "guid": "si-1" } } }
    });

    // Managed parent: create answers with a job.
    Mock::given(method("POST"))
        .and(path("/v3/service_credential_bindings"))
        .respond_with(
            ResponseTemplate::new(202).insert_header(
                "Location",
                format!("{}/v3/jobs/job-bind", server.uri()).as_str(),
            ),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-bind"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "COMPLETE" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/service_credential_bindings"))
        .and(query_param("service_instance_guids", "si-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pagination": { "total_results": 1, "next": null },
            "resources": [binding_body]
        })))
        .mount(&server)
        .await;
    // Credential endpoint is down.
    Mock::given(method("GET"))
        .and(path("/v3/service_credential_bindings/bind-1/details"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errors": [{"code": 10001, "title": "CF-BrokerDown", "detail": "broker 500"}]
        })))
        .mount(&server)
        .await;
    // Parameter endpoint works.
    Mock::given(method("GET"))
        .and(path("/v3/service_credential_bindings/bind-1/parameters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ttl": 60 })))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler =
        cfweave_provider::reconciler_for("cloudfoundry_service_credential_binding").unwrap();
    let desired = json!({
        "type": "key",
        "name": "my-key",
        "service_instance": "si-1"
    });
    let output = reconciler
        .create(&session, desired, &CancelToken::never())
        .await;

    // The binding exists: written to state, warning attached, no error.
    assert!(!output.diagnostics.has_errors());
    assert!(output.diagnostics.iter().any(|d| {
        d.severity == cfweave_core::Severity::Warning && d.summary.contains("credentials")
    }));
    let record = output.record.unwrap();
    assert_eq!(record["credentials"], json!(null));
    assert_eq!(record["broker_parameters"], json!("{\"ttl\":60}"));
    assert_eq!(record["id"], "bind-1");
}

// ---------------------------------------------------------------------------
// S5: MTA identifier mismatch
// ---------------------------------------------------------------------------

fn write_mtar(id: &str) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut archive = zip::ZipWriter::new(file.reopen().unwrap());
    archive
        .start_file::<_, ()>("META-INF/mtad.yaml", zip::write::FileOptions::default())
        .unwrap();
    write!(archive, "_schema-version: '3.1'\nID: {}\nversion: 0.1.0\n", id).unwrap();
    archive.finish().unwrap();
    file
}

#[tokio::test]
async fn mta_update_refuses_new_identifier() {
    let server = MockServer::start().await;
    let session = session_for(&server);
    let archive = write_mtar("my-mta");

    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_mta").unwrap();
    let prior = json!({
        "id": "space-1/a.cf.app",
        "space": "space-1",
        "archive_path": archive.path().to_string_lossy(),
        "namespace": "test",
        "mta_id": "a.cf.app"
    });
    let plan = json!({
        "id": "space-1/a.cf.app",
        "space": "space-1",
        "archive_path": archive.path().to_string_lossy(),
        "namespace": "test",
        "mta_id": "a.cf.app"
    });
    let output = reconciler
        .update(&session, plan, prior, &CancelToken::never())
        .await;
    assert!(output.diagnostics.has_errors());
    let rendered = output.diagnostics.error_summary();
    assert!(rendered.contains("New MTA ID"), "got: {rendered}");
    assert!(rendered.contains("my-mta"));
    // The existing MTA is untouched: nothing hit the platform.
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

// ---------------------------------------------------------------------------
// S1: application blue-green update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn app_blue_green_update_preserves_identifier() {
    let server = MockServer::start().await;
    let archive = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(archive.path(), b"zipbits").unwrap();

    let app_body = json!({
        "guid": "app-1",
        "name": "cf-nodejs-update",
        "state": "STARTED",
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-06-01T00:00:00Z",
        "metadata": { "labels": { "MY_LABEL": "blue" }, "annotations": {} },
        "relationships": { "space": { "data": { "guid": "space-1" } } }
    });

    Mock::given(method("PATCH"))
        .and(path("/v3/apps/app-1"))
        .and(body_string_contains("MY_LABEL"))
        .respond_with(ResponseTemplate::new(200).set_body_json(app_body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/spaces/space-1/actions/apply_manifest"))
        .and(body_string_contains("memory: 256M"))
        .respond_with(
            ResponseTemplate::new(202).insert_header(
                "Location",
                format!("{}/v3/jobs/job-apply", server.uri()).as_str(),
            ),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-apply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "COMPLETE" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/packages"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "guid": "pkg-1", "type": "bits", "state": "AWAITING_UPLOAD"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/packages/pkg-1/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "pkg-1", "type": "bits", "state": "PROCESSING_UPLOAD"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/packages/pkg-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "pkg-1", "type": "bits", "state": "READY"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/builds"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "guid": "build-1", "state": "STAGING"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/builds/build-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "build-1", "state": "STAGED", "droplet": { "guid": "drop-1" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/deployments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "guid": "dep-1", "strategy": "rolling",
            "status": { "value": "DEPLOYING", "reason": "" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/deployments/dep-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "dep-1", "strategy": "rolling",
            "status": { "value": "FINALIZED", "reason": "DEPLOYED" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/apps/app-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(app_body))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/apps/app-1/manifest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "applications:\n- name: cf-nodejs-update\n  memory: 256M\n  disk_quota: 1024mB\n  instances: 2\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/apps/app-1/features/ssh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "ssh", "enabled": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/spaces/space-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "space-1",
            "name": "staging",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "relationships": { "organization": { "data": { "guid": "org-1" } } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/organizations/org-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(org_body("org-1", "acme")))
        .mount(&server)
        .await;

    let session = session_for(&server);
    let reconciler = cfweave_provider::reconciler_for("cloudfoundry_app").unwrap();
    let prior = json!({
        "id": "app-1",
        "name": "cf-nodejs-update",
        "space": "space-1",
        "path": archive.path().to_string_lossy(),
        "memory": "0.5gb",
        "disk_quota": "1024M",
        "instances": 1,
        "strategy": "blue-green",
        "labels": { "MY_LABEL": "red" }
    });
    let plan = json!({
        "id": "app-1",
        "name": "cf-nodejs-update",
        "space": "space-1",
        "path": archive.path().to_string_lossy(),
        "memory": "256M",
        "disk_quota": "1024mB",
        "instances": 2,
        "strategy": "blue-green",
        "labels": { "MY_LABEL": "blue" }
    });
    let output = reconciler
        .update(&session, plan, prior, &CancelToken::never())
        .await;

    assert!(
        !output.diagnostics.has_errors(),
        "unexpected errors: {}",
        output.diagnostics.error_summary()
    );
    let record = output.record.unwrap();
    assert_eq!(record["id"], "app-1");
    assert_eq!(record["memory"], "256M");
    assert_eq!(record["instances"], 2);
    assert_eq!(record["labels"]["MY_LABEL"], "blue");
    assert_eq!(record["space_name"], "staging");
    assert_eq!(record["org_name"], "acme");

    let identity = output.identity.unwrap();
    assert_eq!(identity.to_tuple().get("app_guid").map(String::as_str), Some("app-1"));
}
