pub mod anthropic;
pub mod awsbedrock;
pub mod openai;
