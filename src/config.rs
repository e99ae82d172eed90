use clap::Parser;

use crate::arena::{Arena, HEIGHT, RADIUS, WIDTH};

/// Two-player duel server
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = 4242)]
    pub port: u16,
    /// Arena width
    #[clap(long, default_value_t = WIDTH)]
    pub width: u32,
    /// Arena height
    #[clap(long, default_value_t = HEIGHT)]
    pub height: u32,
    /// Player radius, also the hit distance
    #[clap(long, default_value_t = RADIUS)]
    pub radius: u32,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn arena(&self) -> Arena {
        Arena {
            width: self.width,
            height: self.height,
            radius: self.radius,
        }
    }
}
