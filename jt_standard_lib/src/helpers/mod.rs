pub mod decimal_calculators;
