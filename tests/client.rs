use anyhow::{Result, anyhow};
use httpmock::prelude::*;
use serde_json::{Value, json};
use sliderule::{
    Atl06Parms, Callbacks, Client, ClientConfig, FieldValue, InitOptions, Protocol,
    SignalConfidence, SlideruleError,
};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const RESOURCE: &str = "ATL03_20181019065445_03150111_005_01.h5";

fn frame(rectype: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&2i16.to_be_bytes());
    out.extend_from_slice(&((rectype.len() + 1) as i16).to_be_bytes());
    out.extend_from_slice(&(data.len() as i32).to_be_bytes());
    out.extend_from_slice(rectype.as_bytes());
    out.push(0);
    out.extend_from_slice(data);
    out
}

fn elevation(segment_id: u32, h_mean: f64) -> Vec<u8> {
    let mut out = segment_id.to_le_bytes().to_vec();
    out.extend_from_slice(&1234u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&h_mean.to_le_bytes());
    out
}

fn eventrec(level: u32, attr: &str) -> Vec<u8> {
    let mut out = level.to_le_bytes().to_vec();
    out.extend_from_slice(attr.as_bytes());
    out.push(0);
    out
}

fn client_for(server: &MockServer) -> Client {
    let domain = format!("{}:{}", server.host(), server.port());
    Client::init(ClientConfig::new(domain, None).with_protocol(Protocol::Http))
        .unwrap()
        .with_attempts(1)
}

/// Client for organization `myorg` whose service host resolves to `service`.
fn org_client(service: &MockServer, ps: &MockServer) -> Client {
    let domain = format!("sliderule.test:{}", service.port());
    let cfg = ClientConfig::new(domain, Some("myorg".to_string()))
        .with_protocol(Protocol::Http)
        .with_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    Client::init(cfg)
        .unwrap()
        .with_attempts(1)
        .with_provisioning_url(ps.base_url())
}

/// Answers every connection with `reply` after reading the request; returns
/// the `host:port` to use as domain and the connection count.
fn serve_raw(reply: &'static [u8]) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            read_request(&mut stream);
            let _ = stream.write_all(reply);
        }
    });
    (format!("127.0.0.1:{}", port), hits)
}

fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while let Ok(n) = stream.read(&mut chunk) {
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body {
                break;
            }
        }
    }
}

fn cmr_page(names: &[&str]) -> String {
    let links: Vec<Value> = names
        .iter()
        .map(|n| {
            json!({
                "href": format!("https://n5eil01u.ecs.nsidc.org/ATLAS/ATL03.006/{}", n),
                "rel": "http://esipfed.org/ns/fedsearch/1.1/data#"
            })
        })
        .collect();
    json!({"feed": {"entry": [{"links": links}]}}).to_string()
}

fn mock_definitions(server: &MockServer) -> Vec<httpmock::Mock<'_>> {
    let defs = [
        (
            "atl06rec",
            json!({
                "__datasize": 0,
                "elevation": {"type": "atl06rec.elevation", "offset": 0, "elements": 0, "flags": "LE"}
            }),
        ),
        (
            "atl06rec.elevation",
            json!({
                "__datasize": 16,
                "segment_id": {"type": "UINT32", "offset": 0, "elements": 1, "flags": "LE"},
                "rgt": {"type": "UINT16", "offset": 32, "elements": 1, "flags": "LE"},
                "cycle": {"type": "UINT16", "offset": 48, "elements": 1, "flags": "LE"},
                "h_mean": {"type": "DOUBLE", "offset": 64, "elements": 1, "flags": "LE"}
            }),
        ),
        (
            "eventrec",
            json!({
                "__datasize": 4,
                "level": {"type": "UINT32", "offset": 0, "elements": 1, "flags": "LE"},
                "attr": {"type": "STRING", "offset": 32, "elements": 0, "flags": "LE"}
            }),
        ),
        (
            "h5file",
            json!({
                "__datasize": 80,
                "dataset": {"type": "STRING", "offset": 0, "elements": 64, "flags": "LE"},
                "datatype": {"type": "UINT32", "offset": 512, "elements": 1, "flags": "LE"},
                "size": {"type": "UINT32", "offset": 544, "elements": 1, "flags": "LE"},
                "elements": {"type": "UINT32", "offset": 576, "elements": 1, "flags": "LE"},
                "data": {"type": "UINT8", "offset": 640, "elements": 0, "flags": "LE|BATCH"}
            }),
        ),
    ];

    defs.into_iter()
        .map(|(rectype, doc)| {
            server.mock(|when, then| {
                when.method(GET)
                    .path("/source/definition")
                    .body_contains(format!("\"{}\"", rectype));
                then.status(200)
                    .header("content-type", "application/json")
                    .body(doc.to_string());
            })
        })
        .collect()
}

fn atl06_stream() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend(elevation(101, 1500.25));
    data.extend(elevation(102, 1501.75));

    let mut stream = frame("eventrec", &eventrec(1, "processing started"));
    stream.extend(frame("atl06rec", &data));
    stream
}

fn example_parms() -> Value {
    json!({
        "cnf": "atl03_high",
        "ats": 20.0,
        "cnt": 10,
        "len": 40.0,
        "res": 20.0,
        "maxi": 1
    })
}

#[test]
fn atl06p_returns_flattened_elevations() -> Result<()> {
    let server = MockServer::start();
    let _defs = mock_definitions(&server);
    let atl06 = server.mock(|when, then| {
        when.method(POST)
            .path("/source/atl06p")
            .json_body(json!({"atl06": example_parms(), "resources": [RESOURCE]}));
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let client = client_for(&server);
    let result = client.atl06p(&example_parms(), &[RESOURCE])?;

    atl06.assert();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].rectype, "atl06rec.elevation");
    assert_eq!(result[0].get("segment_id"), Some(&FieldValue::UInt(101)));
    assert_eq!(result[1].get("h_mean").and_then(FieldValue::as_f64), Some(1501.75));
    assert_eq!(result[1].get("rgt"), Some(&FieldValue::UInt(1234)));
    Ok(())
}

#[test]
fn typed_parameters_are_accepted() -> Result<()> {
    let server = MockServer::start();
    let _defs = mock_definitions(&server);
    let atl06 = server.mock(|when, then| {
        when.method(POST).path("/source/atl06p").json_body(json!({
            "atl06": {"cnf": "atl03_high", "ats": 20.0, "cnt": 10, "len": 40.0, "res": 20.0, "maxi": 1},
            "resources": [RESOURCE]
        }));
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let parms = Atl06Parms {
        cnf: Some(SignalConfidence::High),
        ats: Some(20.0),
        cnt: Some(10),
        len: Some(40.0),
        res: Some(20.0),
        maxi: Some(1),
        ..Default::default()
    };
    let result = client_for(&server).atl06p(&parms, &[RESOURCE])?;

    atl06.assert();
    assert_eq!(result.len(), 2);
    Ok(())
}

#[test]
fn definitions_are_fetched_once_per_client() -> Result<()> {
    let server = MockServer::start();
    let defs = mock_definitions(&server);
    server.mock(|when, then| {
        when.method(POST).path("/source/atl06p");
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let client = client_for(&server);
    client.atl06p(&example_parms(), &[RESOURCE])?;
    client.clone().atl06p(&example_parms(), &[RESOURCE])?;

    // atl06rec, atl06rec.elevation, eventrec
    for def in &defs[..3] {
        def.assert_hits(1);
    }
    assert_eq!(
        client.field_type("atl06rec.elevation", "h_mean")?,
        Some(sliderule::FieldType::Double)
    );
    assert_eq!(client.field_type("atl06rec.elevation", "missing")?, None);
    Ok(())
}

#[test]
fn callbacks_take_their_records_out_of_the_result() -> Result<()> {
    let server = MockServer::start();
    let _defs = mock_definitions(&server);
    server.mock(|when, then| {
        when.method(POST).path("/source/atl06p");
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let events = Arc::new(AtomicUsize::new(0));
    let seen = events.clone();
    let mut callbacks = Callbacks::new();
    callbacks.insert(
        "eventrec".to_string(),
        Box::new(move |rec| {
            assert_eq!(
                rec.get("attr").and_then(FieldValue::as_str),
                Some("processing started")
            );
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let rqst = json!({"atl06": example_parms(), "resources": [RESOURCE]});
    let recs = client_for(&server)
        .source_with_callbacks("atl06p", &rqst, true, &mut callbacks)?
        .into_records()?;

    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].rectype, "atl06rec");
    Ok(())
}

#[test]
fn async_success_fires_only_the_success_continuation() {
    let server = MockServer::start();
    let _defs = mock_definitions(&server);
    server.mock(|when, then| {
        when.method(POST).path("/source/atl06p");
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let ok = Arc::new(AtomicUsize::new(0));
    let err = Arc::new(AtomicUsize::new(0));
    let (on_ok, on_err) = (ok.clone(), err.clone());
    let count = client_for(&server)
        .atl06p_async(&example_parms(), &[RESOURCE])
        .then(
            move |result| {
                on_ok.fetch_add(1, Ordering::SeqCst);
                result.len()
            },
            move |_| {
                on_err.fetch_add(1, Ordering::SeqCst);
                0
            },
        )
        .wait()
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(ok.load(Ordering::SeqCst), 1);
    assert_eq!(err.load(Ordering::SeqCst), 0);
}

#[test]
fn async_failure_fires_only_the_failure_continuation() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/source/atl06p");
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"error":"invalid parameter cnf"}"#);
    });

    let ok = Arc::new(AtomicUsize::new(0));
    let on_ok = ok.clone();
    let message = client_for(&server)
        .atl06p_async(&json!({"cnf": "bogus"}), &[RESOURCE])
        .then(
            move |_| {
                on_ok.fetch_add(1, Ordering::SeqCst);
                String::new()
            },
            |e| e.to_string(),
        )
        .wait()
        .unwrap();

    assert_eq!(ok.load(Ordering::SeqCst), 0);
    assert!(message.contains("HTTP error 400"), "{}", message);
    assert!(message.contains("invalid parameter cnf"), "{}", message);
}

#[test]
fn overloaded_server_is_transient_and_not_retried() {
    let server = MockServer::start();
    let busy = server.mock(|when, then| {
        when.method(POST).path("/source/atl06p");
        then.status(503);
    });

    let client = client_for(&server).with_attempts(3);
    let err = client.atl06p(&example_parms(), &[RESOURCE]).unwrap_err();

    busy.assert_hits(1);
    let class = err.downcast_ref::<SlideruleError>().unwrap();
    assert!(class.is_transient());
}

#[test]
fn unreachable_endpoint_fails_after_all_attempts() {
    let client = Client::init(ClientConfig::new("127.0.0.1:1", None))
        .unwrap()
        .with_attempts(2);

    let err = client.atl06p(&example_parms(), &[RESOURCE]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SlideruleError>(),
        Some(SlideruleError::Fatal(_))
    ));
    assert!(err.to_string().contains("Unable to complete request"));
}

#[test]
fn blank_resource_is_rejected_before_any_request() {
    let server = MockServer::start();
    let any = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    let client = client_for(&server);
    assert!(client.atl06p(&example_parms(), &[""]).is_err());
    let none: [&str; 0] = [];
    assert!(client.atl06p(&example_parms(), &none).is_err());
    any.assert_hits(0);
}

#[test]
fn unsupported_content_type_is_fatal() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/source/version");
        then.status(200)
            .header("content-type", "text/html")
            .body("<html></html>");
    });

    let err = client_for(&server)
        .source("version", &json!({}), false)
        .unwrap_err();
    assert!(err.to_string().contains("unsupported content type: text/html"));
}

#[test]
fn version_checks_follow_major_and_minor() -> Result<()> {
    let cases = [
        ("v4.0.3", Some(true)),
        ("v4.7.0", Some(false)),
        ("v5.0.0", None),
    ];
    for (server_version, expected) in cases {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/source/version");
            then.status(200)
                .header("content-type", "application/json")
                .body(json!({"server": {"version": server_version}}).to_string());
        });

        let client = client_for(&server);
        let info = client.get_version()?;
        assert_eq!(
            info["client"]["version"],
            json!(format!("v{}", env!("CARGO_PKG_VERSION")))
        );
        assert_eq!(info["organization"], Value::Null);

        match expected {
            Some(status) => assert_eq!(client.check_version(&[])?, status),
            None => assert!(client.check_version(&[]).is_err()),
        }
    }
    Ok(())
}

#[test]
fn gps2utc_uses_the_time_endpoint() -> Result<()> {
    let server = MockServer::start();
    let time = server.mock(|when, then| {
        when.method(GET)
            .path("/source/time")
            .json_body(json!({"time": 1235331234000i64, "input": "GPS", "output": "DATE"}));
        then.status(200)
            .header("content-type", "text/plain")
            .body(r#"{"time": "2019-02-27T19:34:03Z", "format": "DATE"}"#);
    });

    assert_eq!(client_for(&server).gps2utc(1235331234.0)?, "2019-02-27T19:34:03Z");
    time.assert();
    Ok(())
}

#[test]
fn h5_reads_typed_values() -> Result<()> {
    let server = MockServer::start();
    let _defs = mock_definitions(&server);

    let dataset = "ancillary_data/atlas_sdp_gps_epoch";
    let mut rec = vec![0u8; 64];
    rec[..dataset.len()].copy_from_slice(dataset.as_bytes());
    rec.extend_from_slice(&10u32.to_le_bytes()); // DOUBLE
    rec.extend_from_slice(&8u32.to_le_bytes());
    rec.extend_from_slice(&1u32.to_le_bytes());
    rec.extend_from_slice(&[0u8; 4]);
    rec.extend_from_slice(&1198800018.0f64.to_le_bytes());

    let h5p = server.mock(|when, then| {
        when.method(POST).path("/source/h5p").json_body(json!({
            "asset": "icesat2",
            "resource": RESOURCE,
            "datasets": [{"dataset": dataset, "datatype": 3, "col": 0, "startrow": 0, "numrows": -1}]
        }));
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(frame("h5file", &rec));
    });

    let values = client_for(&server).h5(dataset, RESOURCE, "icesat2")?;
    h5p.assert();
    assert_eq!(values, vec![FieldValue::Real(1198800018.0)]);
    Ok(())
}

#[test]
fn authenticate_stores_and_refreshes_tokens() -> Result<()> {
    let ps = MockServer::start();
    let login = ps.mock(|when, then| {
        when.method(POST).path("/api/org_token/").json_body(json!({
            "username": "alice",
            "password": "s3cret",
            "org_name": "myorg"
        }));
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"access": "a1", "refresh": "r1", "access_lifetime": 0}"#);
    });
    let refresh = ps.mock(|when, then| {
        when.method(POST)
            .path("/api/org_token/refresh/")
            .header("Authorization", "Bearer a1")
            .json_body(json!({"refresh": "r1"}));
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"access": "a2", "refresh": "r2", "access_lifetime": 7200}"#);
    });
    let limits = ps.mock(|when, then| {
        when.method(GET)
            .path("/api/org_num_nodes/myorg/")
            .header("Authorization", "Bearer a2");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"min_nodes": 1, "max_nodes": 3}"#);
    });
    let desired = ps.mock(|when, then| {
        when.method(PUT)
            .path("/api/desired_org_num_nodes/myorg/3/")
            .header("Authorization", "Bearer a2");
        then.status(200)
            .header("content-type", "application/json")
            .body("{}");
    });

    // The service itself is unreachable, so discovery reports no nodes.
    let client = Client::init(
        ClientConfig::new("127.0.0.1:1", Some("myorg".to_string())).with_protocol(Protocol::Http),
    )?
    .with_attempts(1)
    .with_provisioning_url(ps.base_url());

    assert!(client.authenticate(Some("alice"), Some("s3cret"))?);
    std::thread::sleep(std::time::Duration::from_millis(5));

    let (available, requested) = client.update_available_servers(Some(5), None)?;
    assert_eq!(available, 0);
    assert_eq!(requested, 3);

    login.assert();
    refresh.assert();
    limits.assert();
    desired.assert();
    Ok(())
}

#[test]
fn rejected_login_returns_false() -> Result<()> {
    let ps = MockServer::start();
    ps.mock(|when, then| {
        when.method(POST).path("/api/org_token/");
        then.status(401)
            .header("content-type", "application/json")
            .body(r#"{"detail": "bad credentials"}"#);
    });

    let client = Client::init(ClientConfig::new("example.org", Some("myorg".to_string())))?
        .with_provisioning_url(ps.base_url());
    assert!(!client.authenticate(Some("alice"), Some("wrong"))?);

    let public = Client::init(ClientConfig::new("example.org", None))?;
    assert!(public.authenticate(None, None)?);
    Ok(())
}

#[test]
fn truncated_response_is_retried_until_attempts_run_out() {
    let (domain, hits) = serve_raw(
        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"server\":",
    );
    let client = Client::init(ClientConfig::new(domain, None))
        .unwrap()
        .with_attempts(3);

    let err = client.source("version", &json!({}), false).unwrap_err();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(matches!(
        err.downcast_ref::<SlideruleError>(),
        Some(SlideruleError::Fatal(_))
    ));
    assert!(err.to_string().contains("Unable to complete request"));
}

#[test]
fn scaleout_polls_until_the_cluster_reaches_capacity() -> Result<()> {
    let service = MockServer::start();
    let ps = MockServer::start();
    ps.mock(|when, then| {
        when.method(GET).path("/api/org_num_nodes/myorg/");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"min_nodes": 1, "max_nodes": 10}"#);
    });
    let desired = ps.mock(|when, then| {
        when.method(PUT).path("/api/desired_org_num_nodes/myorg/2/");
        then.status(200)
            .header("content-type", "application/json")
            .body("{}");
    });
    let mut growing = service.mock(|when, then| {
        when.method(GET).path("/discovery/status");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"nodes": 1}"#);
    });

    let client = org_client(&service, &ps).with_poll_interval(Duration::from_millis(10));
    thread::scope(|scope| -> Result<()> {
        let worker = scope.spawn(|| client.scaleout(Some(2), None));

        let mut waited = 0;
        while growing.hits() < 2 {
            assert!(waited < 1000, "scaleout never polled the cluster status");
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        let ready = service.mock(|when, then| {
            when.method(GET).path("/discovery/status");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"nodes": 2}"#);
        });
        growing.delete();

        worker.join().map_err(|_| anyhow!("scaleout worker panicked"))??;
        assert!(ready.hits() >= 1);
        Ok(())
    })?;

    desired.assert();
    Ok(())
}

#[test]
fn connect_scales_and_checks_plugin_versions() -> Result<()> {
    let service = MockServer::start();
    let ps = MockServer::start();
    ps.mock(|when, then| {
        when.method(GET).path("/api/org_num_nodes/myorg/");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"min_nodes": 1, "max_nodes": 10}"#);
    });
    let ttl = ps.mock(|when, then| {
        when.method(POST).path("/api/desired_org_num_nodes_ttl/myorg/3/60/");
        then.status(200)
            .header("content-type", "application/json")
            .body("{}");
    });
    let status = service.mock(|when, then| {
        when.method(GET).path("/discovery/status");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"nodes": 3}"#);
    });
    service.mock(|when, then| {
        when.method(GET).path("/source/version");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "server": {"version": "v4.0.1"},
                    "icesat2": {"version": "v4.2.0"}
                })
                .to_string(),
            );
    });

    let opts = InitOptions {
        desired_nodes: Some(3),
        time_to_live: Some(60),
        plugins: vec!["icesat2".to_string()],
    };
    // The plugin is a newer minor version than this client.
    assert!(!org_client(&service, &ps).connect(&opts)?);

    ttl.assert();
    status.assert_hits(1);
    Ok(())
}

#[test]
fn atl06p_without_resources_searches_cmr_for_the_region() -> Result<()> {
    let server = MockServer::start();
    let cmr = MockServer::start();
    let _defs = mock_definitions(&server);
    let granules = [RESOURCE, "ATL03_20190105084711_01130206_006_02.h5"];

    // Registered first so scrolled requests match it before the first page.
    let last_page = cmr.mock(|when, then| {
        when.method(GET)
            .path("/search/granules.json")
            .header("cmr-scroll-id", "scroll-1");
        then.status(200)
            .header("content-type", "application/json")
            .body(cmr_page(&[]));
    });
    let first_page = cmr.mock(|when, then| {
        when.method(GET)
            .path("/search/granules.json")
            .query_param("provider", "NSIDC_ECS")
            .query_param("short_name", "ATL03")
            .query_param("version", "006")
            .query_param("scroll", "true")
            .query_param("polygon", "-108.3,38.9,-107.7,38.9,-107.7,39.2,-108.3,38.9")
            .query_param("temporal[]", "2019-01-01T00:00:00Z,2019-12-31T00:00:00Z");
        then.status(200)
            .header("content-type", "application/json")
            .header("cmr-scroll-id", "scroll-1")
            .body(cmr_page(&granules));
    });

    let mut parms = example_parms();
    parms["poly"] = json!([
        {"lat": 38.9, "lon": -108.3},
        {"lat": 38.9, "lon": -107.7},
        {"lat": 39.2, "lon": -107.7},
        {"lat": 38.9, "lon": -108.3}
    ]);
    parms["t0"] = json!("2019-01-01T00:00:00Z");
    parms["t1"] = json!("2019-12-31T00:00:00Z");

    let atl06 = server.mock(|when, then| {
        when.method(POST)
            .path("/source/atl06p")
            .json_body(json!({"atl06": parms, "resources": granules}));
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body(atl06_stream());
    });

    let none: [&str; 0] = [];
    let result = client_for(&server)
        .with_cmr_url(cmr.base_url())
        .atl06p(&parms, &none)?;

    first_page.assert();
    last_page.assert();
    atl06.assert();
    assert_eq!(result.len(), 2);
    Ok(())
}

#[test]
fn cmr_rejects_more_granules_than_allowed() {
    let cmr = MockServer::start();
    let search = cmr.mock(|when, then| {
        when.method(GET).path("/search/granules.json");
        then.status(200)
            .header("content-type", "application/json")
            .body(cmr_page(&["ATL03_a.h5", "ATL03_b.h5", "ATL03_c.h5"]));
    });

    let client = Client::init(ClientConfig::new("localhost", None))
        .unwrap()
        .with_cmr_url(cmr.base_url())
        .with_max_resources(2);
    let err = client.cmr("ATL03", None, None, None).unwrap_err();

    // No scroll id came back, so there is no second page to ask for.
    search.assert_hits(1);
    assert!(err
        .to_string()
        .contains("Exceeded maximum requested resources: 3 (current max is 2)"));
}

#[test]
fn out_of_range_node_count_is_an_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/discovery/status");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"nodes": 4294967296}"#);
    });

    let err = client_for(&server)
        .update_available_servers(None, None)
        .unwrap_err();
    assert!(err.to_string().contains("out of range"), "{:#}", err);
}
