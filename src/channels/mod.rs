pub mod whatsapp_web;

pub use whatsapp_web::WhatsAppWebConnector;
