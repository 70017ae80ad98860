pub mod health {
    use rocket::{get, serde::json::Json};
    use serde_json::{json, Value};

    #[get("/health")]
    pub async fn health_check() -> Json<Value> {
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "snowball-engine"
        }))
    }

    #[get("/")]
    pub async fn index() -> Json<Value> {
        Json(json!({
            "name": "Email Repository Snowball Engine",
            "version": "0.1.0",
            "description": "Grows and governs curated email repositories through viral forwarding",
            "endpoints": {
                "health": "/api/health",
                "repositories": "/api/repositories",
                "imports": "/api/imports",
                "forwards": "/api/forwards",
                "analytics": "/api/repositories/<id>/analytics"
            }
        }))
    }
}
