mod external;
mod resources;
mod utils;
