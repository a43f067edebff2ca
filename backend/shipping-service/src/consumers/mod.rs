pub mod saga_events;
