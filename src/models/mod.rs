pub mod event;
pub mod payment;
pub mod ticket;
pub mod user;

pub use event::Event;
pub use payment::{Payment, PaymentStatus};
pub use ticket::{Ticket, TicketStatus, TicketType};
pub use user::{Attendee, User};
