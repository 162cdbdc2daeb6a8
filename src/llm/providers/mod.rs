pub mod anthropic_compatible;
