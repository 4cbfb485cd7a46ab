use std::env;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub crcon_url: String,
    pub crcon_api_key: String,
    pub crcon_server_number: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("VIP_LINK_PORT")
                .unwrap_or_else(|_| "9103".to_string())
                .parse()
                .expect("VIP_LINK_PORT must be a valid number"),
            database_path: env::var("VIP_LINK_DB_PATH")
                .unwrap_or_else(|_| "./vip_link.db".to_string()),
            crcon_url: env::var("CRCON_URL").expect("CRCON_URL must be set"),
            crcon_api_key: env::var("CRCON_API_KEY").expect("CRCON_API_KEY must be set"),
            crcon_server_number: env::var("CRCON_SERVER_NUMBER")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .expect("CRCON_SERVER_NUMBER must be a valid number"),
        }
    }
}
