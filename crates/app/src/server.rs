//! Actix Web surface: session control, status, results and the MJPEG stream.
//!
//! Every route is reachable both at the root and under `/api`, and the
//! stream is also served at `/video_feed`, so older dashboards keep working.
//! All responses carry permissive CORS headers.

use std::sync::Arc;

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::{Method, header},
    middleware::DefaultHeaders,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use tracing::{error, info};
use vision::{
    ControlReply, FrameEncoder, MULTIPART_CONTENT_TYPE, PipelineContext, StreamOptions,
    encode_with_fallback, mjpeg_stream, telemetry,
};

pub const BANNER: &str = "PPE Detection API Server";

/// Shared state behind every handler.
pub struct AppState {
    pub pipeline: Arc<PipelineContext>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub stream: StreamOptions,
}

/// Bind and serve until the server is told to stop (SIGINT or SIGTERM).
pub async fn serve(host: &str, port: u16, state: web::Data<AppState>) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_headers())
            .configure(configure)
    })
    .bind((host, port))
    .with_context(|| format!("failed to bind {host}:{port}"))?
    .run();

    info!(host, port, "PPE detection API listening");
    server.await.context("HTTP server error")
}

pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
}

/// Register all routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)).route(preflight_route()));
    for prefix in ["", "/api"] {
        cfg.service(
            web::resource(format!("{prefix}/start"))
                .route(web::post().to(start))
                .route(preflight_route()),
        )
        .service(
            web::resource(format!("{prefix}/stop"))
                .route(web::post().to(stop))
                .route(preflight_route()),
        )
        .service(
            web::resource(format!("{prefix}/status"))
                .route(web::get().to(status))
                .route(preflight_route()),
        )
        .service(
            web::resource(format!("{prefix}/results"))
                .route(web::get().to(results))
                .route(preflight_route()),
        )
        .service(
            web::resource(format!("{prefix}/stream"))
                .route(web::get().to(stream))
                .route(preflight_route()),
        )
        .service(
            web::resource(format!("{prefix}/frame.jpg"))
                .route(web::get().to(frame))
                .route(preflight_route()),
        );
    }
    cfg.service(
        web::resource("/video_feed")
            .route(web::get().to(stream))
            .route(preflight_route()),
    )
    .service(
        web::resource("/metrics")
            .route(web::get().to(metrics))
            .route(preflight_route()),
    )
    .default_service(web::to(fallback));
}

fn preflight_route() -> actix_web::Route {
    web::method(Method::OPTIONS).to(preflight)
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent()
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"))
        .insert_header((header::ACCESS_CONTROL_MAX_AGE, "86400"))
        .finish()
}

async fn fallback(req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        preflight().await
    } else {
        HttpResponse::NotFound().finish()
    }
}

async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(BANNER)
}

/// Start and stop block on camera and thread work, so they leave the
/// async workers.
async fn start(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = state.pipeline.clone();
    control_response(web::block(move || pipeline.start()).await)
}

async fn stop(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = state.pipeline.clone();
    control_response(web::block(move || pipeline.stop()).await)
}

fn control_response(outcome: Result<ControlReply, actix_web::error::BlockingError>) -> HttpResponse {
    match outcome {
        Ok(reply) => HttpResponse::Ok().json(reply),
        Err(err) => {
            error!("control request failed: {err}");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "success": false,
                "message": format!("internal error: {err}"),
            }))
        }
    }
}

async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.pipeline.status())
}

async fn results(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.pipeline.results())
}

async fn stream(state: web::Data<AppState>) -> HttpResponse {
    let chunks = mjpeg_stream(
        state.pipeline.store(),
        state.encoder.clone(),
        state.stream.clone(),
    )
    .map(Ok::<Bytes, actix_web::Error>);

    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE))
        .streaming(chunks)
}

async fn frame(state: web::Data<AppState>) -> HttpResponse {
    let store = state.pipeline.store();
    let encoder = state.encoder.clone();
    let encoded = web::block(move || {
        let latest = store.latest_frame();
        let placeholder = store.placeholder();
        encode_with_fallback(&latest, &placeholder, encoder.as_ref())
            .map(|(frame, body)| {
                (frame.frame_number, Arc::ptr_eq(&frame, &placeholder), body)
            })
    })
    .await;

    match encoded {
        Ok(Some((frame_number, is_placeholder, body))) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Frame-Number", frame_number.to_string()))
            .insert_header(("X-Placeholder", is_placeholder.to_string()))
            .content_type(state.encoder.content_type())
            .body(body),
        Ok(None) => HttpResponse::ServiceUnavailable().body("frame could not be encoded"),
        Err(err) => {
            error!("frame request failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn metrics() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::pin,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use actix_web::{body::MessageBody, http::StatusCode, test};
    use futures_util::future::poll_fn;
    use ml_core::FrameResult;
    use serde_json::Value;
    use vision::{
        AnnotatedFrame, Counters, EncodeError, JpegFrameEncoder, PipelineConfig,
        testing::{FailingModelLoader, ScriptedCamera, StaticModel, StaticModelLoader},
    };

    use super::*;

    fn state_with(
        camera: ScriptedCamera,
        loader: Arc<dyn ml_core::ModelLoader>,
    ) -> web::Data<AppState> {
        let config = PipelineConfig {
            camera_indices: vec![0],
            ..PipelineConfig::default()
        };
        let stream = config.stream.clone();
        web::Data::new(AppState {
            pipeline: Arc::new(PipelineContext::new(config, Arc::new(camera), loader)),
            encoder: Arc::new(JpegFrameEncoder::default()),
            stream,
        })
    }

    fn working_state() -> web::Data<AppState> {
        state_with(
            ScriptedCamera::new(160, 120),
            Arc::new(StaticModelLoader::new(StaticModel::ppe())),
        )
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .wrap(cors_headers())
                    .configure(configure),
            )
            .await
        };
    }

    macro_rules! post_json {
        ($app:expr, $path:expr) => {{
            let req = test::TestRequest::post().uri($path).to_request();
            let reply: Value = test::call_and_read_body_json(&$app, req).await;
            reply
        }};
    }

    #[actix_web::test]
    async fn index_returns_banner() {
        let app = app!(working_state());
        let req = test::TestRequest::get().uri("/").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, Bytes::from_static(BANNER.as_bytes()));
    }

    #[actix_web::test]
    async fn idle_status_reports_zero_counts() {
        let app = app!(working_state());
        let req = test::TestRequest::get().uri("/api/status").to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["active"], false);
        assert_eq!(status["violations"], 0);
        assert_eq!(status["helmets"], 0);
        assert_eq!(status["vests"], 0);
        assert_eq!(status["state"], "idle");
    }

    #[actix_web::test]
    async fn start_stop_lifecycle() {
        let state = working_state();
        let app = app!(state);

        let reply = post_json!(app, "/api/start");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["message"], "Detection started");

        let reply = post_json!(app, "/start");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["message"], "Detection already running");

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.pipeline.status().frames == 0 {
            assert!(Instant::now() < deadline, "no frame published");
            actix_web::rt::time::sleep(Duration::from_millis(10)).await;
        }

        let req = test::TestRequest::get().uri("/results").to_request();
        let results: Value = test::call_and_read_body_json(&app, req).await;
        let first = &results["results"][0];
        assert_eq!(first["frame_number"], 1);
        assert_eq!(first["detections"][0]["label"], "Hardhat");

        let req = test::TestRequest::get().uri("/status").to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["active"], true);
        assert!(status["helmets"].as_u64().unwrap() >= 1);

        let reply = post_json!(app, "/api/stop");
        assert_eq!(reply["success"], true);
        let reply = post_json!(app, "/stop");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["message"], "Detection not running");
    }

    #[actix_web::test]
    async fn start_failures_are_reported_not_raised() {
        let app = app!(state_with(
            ScriptedCamera::unavailable(),
            Arc::new(StaticModelLoader::new(StaticModel::ppe())),
        ));
        let req = test::TestRequest::post().uri("/api/start").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let reply: Value = test::read_body_json(resp).await;
        assert_eq!(reply["success"], false);

        let app = app!(state_with(ScriptedCamera::new(64, 48), Arc::new(FailingModelLoader)));
        let reply = post_json!(app, "/api/start");
        assert_eq!(reply["success"], false);
        assert!(
            reply["message"]
                .as_str()
                .unwrap()
                .starts_with("Failed to load detection model")
        );
    }

    #[actix_web::test]
    async fn cors_headers_and_preflight() {
        let app = app!(working_state());
        let req = test::TestRequest::get().uri("/status").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );

        for path in ["/api/start", "/anything"] {
            let req = test::TestRequest::default()
                .method(Method::OPTIONS)
                .uri(path)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
            assert_eq!(
                resp.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
                "GET, POST, OPTIONS"
            );
        }
    }

    #[actix_web::test]
    async fn frame_endpoint_serves_placeholder_jpeg() {
        let app = app!(working_state());
        let req = test::TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
        assert_eq!(resp.headers().get("X-Placeholder").unwrap(), "true");
        let body = test::read_body(resp).await;
        assert_eq!(&body[..2], &[0xFF_u8, 0xD8]);
    }

    /// Refuses the first frame it sees, then encodes as JPEG.
    struct FirstFrameFails {
        calls: AtomicUsize,
    }

    impl FrameEncoder for FirstFrameFails {
        fn encode(&self, image: &image::RgbImage) -> Result<Vec<u8>, EncodeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(EncodeError("refused".into()));
            }
            JpegFrameEncoder::default().encode(image)
        }

        fn content_type(&self) -> &'static str {
            "image/jpeg"
        }
    }

    #[actix_web::test]
    async fn frame_endpoint_flags_encode_fallback_as_placeholder() {
        let state = working_state();
        let store = state.pipeline.store();
        let mut published: AnnotatedFrame = (*store.placeholder()).clone();
        published.frame_number = 7;
        store.publish(
            published,
            FrameResult::empty(7, chrono::Utc::now()),
            Counters::default(),
        );

        let state = web::Data::new(AppState {
            pipeline: state.pipeline.clone(),
            encoder: Arc::new(FirstFrameFails {
                calls: AtomicUsize::new(0),
            }),
            stream: state.stream.clone(),
        });
        let app = app!(state);
        let req = test::TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Placeholder").unwrap(), "true");
        assert_eq!(resp.headers().get("X-Frame-Number").unwrap(), "0");
    }

    #[actix_web::test]
    async fn stream_emits_multipart_chunks() {
        let app = app!(working_state());
        for path in ["/stream", "/video_feed"] {
            let req = test::TestRequest::get().uri(path).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(
                resp.headers().get(header::CONTENT_TYPE).unwrap(),
                MULTIPART_CONTENT_TYPE
            );

            let mut body = pin!(resp.into_body());
            let chunk = poll_fn(|cx| body.as_mut().poll_next(cx))
                .await
                .unwrap()
                .unwrap();
            assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        }
    }
}
