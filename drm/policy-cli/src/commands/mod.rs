mod apply;
mod check;
mod settings;
mod show_state;
mod state;

pub use self::apply::ApplyCommand;
pub use self::check::CheckCommand;
pub use self::show_state::ShowStateCommand;
